//! Loader binary (§4.1, §4.7, §4.8, §5): the strict serial loop
//! `tpop -> validate -> handler -> write -> commit_or_rollback`. Exactly one
//! envelope is in flight at a time; a single consumer owns the spool, so
//! document-DB and search-index writes for a given artifact never race each
//! other within this process.

#![deny(unsafe_code)]

use clap::Parser;
use kaijs_config::Config;
use kaijs_dispatch::DispatchRegistry;
use kaijs_docdb::{write_with_occ, FileDocStore};
use kaijs_error::{disposition, Disposition, ErrorCode, KaijsError, KaijsErrorDto};
use kaijs_handlers::{HandlerOutcome, HandlerRegistry};
use kaijs_index::{
    invalid_message_doc, resolve_index_name, BulkScheduler, Context, IndexStore, MemoryIndexStore,
    INVALID_MESSAGES_INDEX,
};
use kaijs_model::{
    ArtifactDocument, ArtifactPayload, ArtifactType, ChildDoc, IndexUpdate, JoinField, ParentDoc,
    SpoolMessage,
};
use kaijs_schema::SchemaCatalog;
use kaijs_spool::{Claim, Spool};
use kaijs_validate::{RelaxedShape, ShapeRegistry, Validator};
use kaijs_xmlrpc::HttpBuildsysClient;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const IDLE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "kaijs-loader", version, about = "CI envelope loader")]
struct Args {
    /// Override `KAIJS_SPOOL_DIR`.
    #[arg(long)]
    spool_dir: Option<String>,
    /// Directory backing the file-based document store.
    #[arg(long, default_value = "./docdb")]
    docdb_dir: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("invalid configuration, falling back to defaults: {e}");
        Config::default()
    });
    if let Some(dir) = args.spool_dir {
        config.spool_dir = dir;
    }

    init_tracing(&config);

    let spool = match Spool::open_with_scan_batch(&config.spool_dir, config.spool_scan_batch) {
        Ok(s) => s,
        Err(e) => {
            error!(target: "kaijs::loader", error = %e, "failed to open spool");
            std::process::exit(1);
        }
    };

    let catalog = match SchemaCatalog::open(&config.schema_cache_dir, &config.schema_repo_url) {
        Ok(c) => c,
        Err(e) => {
            error!(target: "kaijs::loader", error = %e, "failed to open schema catalog");
            std::process::exit(1);
        }
    };
    let validator = Validator::new(&catalog, default_non_ci_shapes());

    let dispatch = match kaijs_dispatch::default_registry() {
        Ok(r) => r,
        Err(e) => {
            error!(target: "kaijs::loader", error = %e, "failed to build dispatch registry");
            std::process::exit(1);
        }
    };

    let buildsys_client = match HttpBuildsysClient::new(&config.buildsys_xmlrpc_url) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(target: "kaijs::loader", error = %e, "failed to build buildsys client");
            std::process::exit(1);
        }
    };
    let handlers = kaijs_handlers::default_registry(buildsys_client);

    let docdb = FileDocStore::new(&args.docdb_dir);
    let index_store: Arc<dyn IndexStore> = Arc::new(MemoryIndexStore::new());
    let scheduler = BulkScheduler::with_thresholds(
        config.bulk_flush_count,
        config.bulk_flush_bytes as usize,
        Duration::from_millis(config.bulk_flush_idle_ms),
    );

    let ctx = LoaderCtx {
        validator,
        dispatch,
        handlers,
        docdb,
        index_store,
        index_prefix: config.search_index_prefix.clone(),
        occ_max_retries: config.occ_max_retries,
    };

    run(spool, ctx, scheduler).await;
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Declarative shapes for the non-CI topics this loader's handlers cover;
/// these topics carry no JSON-Schema counterpart so the relaxed-shape path
/// is always taken, per §4.4.
fn default_non_ci_shapes() -> ShapeRegistry {
    let mut shapes = ShapeRegistry::new();
    let bare = RelaxedShape { required_pointers: Vec::new() };
    for pattern in [
        r"\.brew-build\.tag$",
        r"\.brew-build\.complete$",
        r"\.buildsys\.tag$",
        r"\.errata_automation\.brew-build\.run\.finished$",
    ] {
        let _ = shapes.register(pattern, bare.clone());
    }
    shapes
}

struct LoaderCtx<'a> {
    validator: Validator<'a>,
    dispatch: DispatchRegistry,
    handlers: HandlerRegistry,
    docdb: FileDocStore,
    index_store: Arc<dyn IndexStore>,
    index_prefix: String,
    occ_max_retries: u32,
}

async fn run(spool: Spool, ctx: LoaderCtx<'_>, mut scheduler: BulkScheduler) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!(target: "kaijs::loader", "shutdown signal received, finishing in-flight envelope");
        stop_signal.store(true, Ordering::SeqCst);
    });

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match spool.tpop() {
            Ok(Some(claim)) => process_one(claim, &ctx, &mut scheduler).await,
            Ok(None) => {
                flush_if_idle(&ctx, &mut scheduler);
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
            Err(e) => {
                error!(target: "kaijs::loader", error = %e, "failed to pop spool");
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
        }
    }

    if let Some(batch) = scheduler.flush_now() {
        exit_on_fatal_bulk_error(ctx.index_store.bulk(&batch));
    }
    info!(target: "kaijs::loader", "loader stopped");
}

/// §4.8: a bulk error rolls back the whole batch and, per §7's
/// connection-lost handling, exits the process non-zero rather than
/// continuing to drain the spool against a broken index.
fn exit_on_fatal_bulk_error(result: Result<(), KaijsError>) {
    if let Err(e) = result {
        error!(target: "kaijs::loader", error = %e, "bulk flush failed");
        if let Disposition::FatalExit(code) = disposition(e.code) {
            std::process::exit(code);
        }
    }
}

fn flush_if_idle(ctx: &LoaderCtx<'_>, scheduler: &mut BulkScheduler) {
    if let Some(batch) = scheduler.poll_idle() {
        exit_on_fatal_bulk_error(ctx.index_store.bulk(&batch));
    }
}

async fn process_one(claim: Claim, ctx: &LoaderCtx<'_>, scheduler: &mut BulkScheduler) {
    let msg = claim.message().clone();
    match process(&msg, ctx, scheduler).await {
        Ok(()) => {
            if let Err(e) = claim.commit() {
                error!(target: "kaijs::loader", error = %e, "failed to commit processed envelope");
            }
        }
        Err(err) => resolve_disposition(claim, &msg, err, ctx, scheduler),
    }
}

fn resolve_disposition(
    claim: Claim,
    msg: &SpoolMessage,
    err: KaijsError,
    ctx: &LoaderCtx,
    scheduler: &mut BulkScheduler,
) {
    match disposition(err.code) {
        Disposition::Commit => {
            info!(target: "kaijs::loader", code = %err.code, msg_id = %msg.broker_msg_id, "dropping envelope silently");
            let _ = claim.commit();
        }
        Disposition::CommitInvalid => {
            warn!(target: "kaijs::loader", code = %err.code, msg_id = %msg.broker_msg_id, error = %err, "routing envelope to invalid-messages sink");
            sink_invalid(msg, &err, &ctx.index_store, &ctx.index_prefix, scheduler);
            let _ = claim.commit();
        }
        Disposition::Rollback => {
            warn!(target: "kaijs::loader", code = %err.code, msg_id = %msg.broker_msg_id, error = %err, "rolling back envelope for retry");
            let _ = claim.rollback();
        }
        Disposition::FatalExit(code) => {
            error!(target: "kaijs::loader", code = %err.code, error = %err, "fatal error, exiting");
            let _ = claim.rollback();
            std::process::exit(code);
        }
    }
}

fn sink_invalid(
    msg: &SpoolMessage,
    err: &KaijsError,
    index_store: &Arc<dyn IndexStore>,
    index_prefix: &str,
    scheduler: &mut BulkScheduler,
) {
    let dto = KaijsErrorDto::from(err);
    let doc = invalid_message_doc(&msg.body, &dto);
    let index_name = resolve_index_name(index_prefix, Context::from_topic(&msg.broker_topic), INVALID_MESSAGES_INDEX);
    let update = IndexUpdate {
        doc_id: msg.broker_msg_id.clone(),
        index_name,
        doc: doc.clone(),
        upsert: Some(doc),
        routing: msg.broker_msg_id.clone(),
        doc_as_upsert: true,
    };
    flush_update(index_store, scheduler, update);
}

fn flush_update(index_store: &Arc<dyn IndexStore>, scheduler: &mut BulkScheduler, update: IndexUpdate) {
    if let Some(batch) = scheduler.push(update) {
        exit_on_fatal_bulk_error(index_store.bulk(&batch));
    }
}

async fn process(msg: &SpoolMessage, ctx: &LoaderCtx<'_>, scheduler: &mut BulkScheduler) -> Result<(), KaijsError> {
    ctx.validator.validate(msg)?;

    let topic = SpoolMessage::normalize_topic(&msg.broker_topic);
    let key = ctx.dispatch.resolve_or_err(&topic)?.to_string();
    let handler = ctx.handlers.get(&key).ok_or_else(|| {
        KaijsError::new(ErrorCode::NoAssociatedHandlerError, format!("no handler registered for key {key}"))
    })?;

    let version = msg.body.get("version").and_then(Value::as_str).unwrap_or("v1").to_string();
    let outcome = handler.transform(msg, &version).await?;

    let document = write_document(&outcome, ctx)?;
    write_index(msg, &outcome, &document, ctx, scheduler);
    Ok(())
}

fn write_document(outcome: &HandlerOutcome, ctx: &LoaderCtx) -> Result<ArtifactDocument, KaijsError> {
    let artifact_type = outcome.artifact_type;
    let aid = outcome.aid.clone();
    let state = outcome.state.clone();
    let payload = payload_for(artifact_type, outcome.payload.clone());

    write_with_occ(
        &ctx.docdb,
        artifact_type,
        &aid,
        ctx.occ_max_retries,
        |seed| {
            let mut computed = seed.clone();
            computed.payload = payload.clone();
            computed.push_state_deduped(state.clone());
            if artifact_type == ArtifactType::RedhatContainerImage {
                computed.expire_at = Some(ArtifactDocument::container_image_expiry(state.timestamp));
            } else if outcome.scratch {
                computed.expire_at = Some(ArtifactDocument::scratch_expiry(state.timestamp));
            }
            Ok(computed)
        },
        |_computed| Ok(()),
    )
}

fn payload_for(artifact_type: ArtifactType, value: Value) -> ArtifactPayload {
    match artifact_type {
        ArtifactType::RedhatModule | ArtifactType::FedoraModule => ArtifactPayload::MbsBuild(value),
        ArtifactType::DistGitPr => ArtifactPayload::DistGitPr(value),
        ArtifactType::ProductmdCompose => ArtifactPayload::ProductmdCompose(value),
        _ => ArtifactPayload::RpmBuild(value),
    }
}

fn write_index(
    msg: &SpoolMessage,
    outcome: &HandlerOutcome,
    document: &ArtifactDocument,
    ctx: &LoaderCtx,
    scheduler: &mut BulkScheduler,
) {
    let artifact_type_str = outcome.artifact_type.as_str();
    let context = Context::from_topic(&msg.broker_topic);
    let index_name = resolve_index_name(&ctx.index_prefix, context, artifact_type_str);
    let parent_doc_id = ParentDoc::doc_id_for(artifact_type_str, &outcome.aid);

    let parent = ParentDoc {
        doc_id: parent_doc_id.clone(),
        searchable: outcome.parent_searchable.clone(),
        join: JoinField::parent(),
    };
    let child = ChildDoc {
        doc_id: msg.broker_msg_id.clone(),
        searchable: outcome.child_searchable.clone(),
        envelope: msg.clone(),
        join: JoinField::child(parent_doc_id.clone()),
    };

    let _ = document; // the merged document is already durable; the index is a derived projection.
    flush_update(&ctx.index_store, scheduler, IndexUpdate::for_parent(index_name.clone(), &parent));
    flush_update(&ctx.index_store, scheduler, IndexUpdate::for_child(index_name, &child, &parent_doc_id));
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigabrt = signal(SignalKind::hangup()).expect("install SIGABRT-equivalent handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        _ = sigabrt.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
