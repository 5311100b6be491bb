use clap::Parser;
use gbsip::{
    config::DEFAULT_IDENTITY,
    manscdp,
    router::{handler, HandlerRef},
    Error, Result, Server, ServerConfig,
};
use rsip::{Method, StatusCode};
use std::{net::SocketAddr, time::Duration};
use tokio::select;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "GB28181 signaling server")]
struct Args {
    /// UDP listen address
    #[arg(long, env = "GBS_UDP", default_value = "0.0.0.0:5060")]
    udp: SocketAddr,

    /// TCP listen address, TCP is disabled when unset
    #[arg(long, env = "GBS_TCP")]
    tcp: Option<SocketAddr>,

    /// Server identity placed in From of issued requests
    #[arg(long, env = "GBS_IDENTITY", default_value = DEFAULT_IDENTITY)]
    identity: String,

    /// Transaction lifetime in seconds
    #[arg(long, env = "GBS_TTL_SECS", default_value = "32")]
    ttl_secs: u64,
}

/// Accepts the registration, then asks the device for its catalog.
fn register() -> HandlerRef {
    handler(|ctx| {
        Box::pin(async move {
            ctx.string(StatusCode::OK, "OK").await;

            let sn = rand::random::<u16>().to_string();
            let query = format!(
                "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>Catalog</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n</Query>\r\n",
                sn, ctx.device_id
            );
            let device_id = ctx.device_id.clone();
            ctx.observer().register(
                format!("catalog:{}:{}", device_id, sn),
                Duration::from_secs(30),
                move |_, args| {
                    info!("catalog of {}: {} bytes", device_id, args.first().map_or(0, |b| b.len()));
                    true
                },
            );
            if let Err(e) = ctx.send_request(Method::Message, query.into_bytes()).await {
                warn!("catalog query to {} failed: {}", ctx.device_id, e);
            }
        })
    })
}

fn keepalive() -> HandlerRef {
    handler(|ctx| {
        Box::pin(async move {
            info!("keepalive from {}", ctx.device_id);
            ctx.string(StatusCode::OK, "OK").await;
        })
    })
}

/// Acknowledges a catalog report and hands it to whoever queried it.
fn catalog() -> HandlerRef {
    handler(|ctx| {
        Box::pin(async move {
            ctx.string(StatusCode::OK, "OK").await;
            let sn = match manscdp::decode(&ctx.request.inner.body) {
                Ok(msg) => msg.sn,
                Err(e) => {
                    warn!("catalog body: {}", e);
                    return;
                }
            };
            let key = format!("catalog:{}:{}", ctx.device_id, sn);
            let body = String::from_utf8_lossy(&ctx.request.inner.body).to_string();
            if !ctx.observer().notify(&key, &[body.as_str()]) {
                info!("unsolicited catalog from {} sn={}", ctx.device_id, sn);
            }
        })
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    let args = Args::parse();
    if args.ttl_secs == 0 {
        return Err(Error::ConfigError(
            "ttl-secs must be positive".to_string(),
        ));
    }

    let config = ServerConfig {
        udp_addr: Some(args.udp),
        tcp_addr: args.tcp,
        identity: args.identity,
        transaction_ttl_secs: args.ttl_secs,
        ..Default::default()
    };
    let server = Server::builder()
        .with_config(config)
        .with_transaction_ttl(Duration::from_secs(args.ttl_secs))
        .build()?;

    server.register(vec![register()]);
    server
        .message(vec![])
        .handle("Keepalive", vec![keepalive()])
        .handle("Catalog", vec![catalog()]);
    server.notify(vec![]).handle("Keepalive", vec![keepalive()]);

    info!("starting {} as {}", gbsip::VERSION, server.identity());
    select! {
        r = server.serve() => {
            info!("server finished: {:?}", r);
            r?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    server.close();
    Ok(())
}
