use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use shardbridge::{
    event::{
        Config, EventStream, EventSubscription, Method, RequestEvent, ResourceRequest,
        ResponseEvent,
    },
    mount::{Mount, RemoteMount},
    shard::{trace_loop, ShardState, ShardTrace},
};
use tokio::{io::AsyncReadExt, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_PIECE_DIR: &str = "/tmp/mnt/piece";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let piece_dir = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_PIECE_DIR.into()));
    let resource_id = args.next().unwrap_or_else(|| "piece".into());

    let ctx = CancellationToken::new();
    let stream = Arc::new(EventStream::new(Config::default())?);

    // a storage provider connecting in-process
    let subscription = stream.listen(ctx.child_token(), Some("in-process".into())).await?;
    let provider = tokio::spawn(serve_pieces(stream.clone(), subscription, piece_dir));

    let (trace_tx, trace_rx) = mpsc::channel(28);
    let tracer = tokio::spawn(trace_loop(ctx.child_token(), trace_rx));
    let trace = |state: ShardState, error: Option<String>| ShardTrace {
        key: resource_id.clone(),
        op: "register".into(),
        state,
        error,
    };

    trace_tx.send(trace(ShardState::New, None)).await?;
    let mount = RemoteMount::new(&ctx, resource_id.clone(), stream.clone()).await?;
    trace_tx.send(trace(ShardState::Initializing, None)).await?;

    match mount.fetch(&ctx).await {
        Ok(mut reader) => {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            info!(
                resource = %resource_id,
                size = data.len(),
                digest = %blake3::hash(&data),
                "fetched shard"
            );
            trace_tx.send(trace(ShardState::Available, None)).await?;
        }
        Err(e) => {
            trace_tx.send(trace(ShardState::Errored, Some(e.to_string()))).await?;
        }
    }
    info!("stat: {:?}", mount.stat(&ctx).await?);

    drop(trace_tx);
    let traced = tracer.await?;
    info!(traced, "shutting down");
    ctx.cancel();
    provider.await?;
    Ok(())
}

/// Answers requests from files under `piece_dir`, named by resource ID.
async fn serve_pieces(
    stream: Arc<EventStream>,
    mut subscription: EventSubscription,
    piece_dir: PathBuf,
) {
    while let Some(request) = subscription.recv().await {
        if request.method == Method::InitConnect {
            info!("connected as channel {}", subscription.channel_id());
            continue;
        }
        let response = answer(&request, &piece_dir).await;
        stream.respond(response);
    }
}

async fn answer(request: &RequestEvent, piece_dir: &Path) -> ResponseEvent {
    let resource: ResourceRequest = match serde_json::from_slice(&request.payload) {
        Ok(resource) => resource,
        Err(e) => return ResponseEvent::err(request.id, e.to_string()),
    };
    let path = piece_dir.join(&resource.resource_id);
    match request.method {
        Method::HasResource => {
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            match serde_json::to_vec(&exists) {
                Ok(payload) => ResponseEvent::ok(request.id, payload),
                Err(e) => ResponseEvent::err(request.id, e.to_string()),
            }
        }
        Method::GetResource => match tokio::fs::read(&path).await {
            Ok(data) => ResponseEvent::ok(request.id, data),
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                ResponseEvent::err(request.id, e.to_string())
            }
        },
        Method::InitConnect => ResponseEvent::err(request.id, "unexpected handshake"),
    }
}
