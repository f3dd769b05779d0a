//! tickio CLI - 演示客户端
//!
//! 以固定帧率调用 `tick()`，模拟游戏循环驱动的宿主。

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tickio_client::{SocketClient, SocketConfig, SocketIoEvent, TlsConfig};
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// tickio demo client
#[derive(Parser, Debug)]
#[command(name = "tickio")]
#[command(version, about = "Tick-driven Socket.IO demo client")]
struct Args {
    /// Server URL (defaults to TICKIO_URL or the local demo server)
    #[arg(short, long)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// How many times per second to call tick()
    #[arg(long, default_value_t = 60)]
    tick_hz: u32,

    /// Seconds between "beep" emits
    #[arg(long, default_value_t = 2.0)]
    beep_interval: f64,

    /// Emit this event once instead of beeping, then exit
    #[arg(long)]
    emit: Option<String>,

    /// JSON data for --emit
    #[arg(long, requires = "emit")]
    data: Option<String>,

    /// Wait for and print the server ack for --emit
    #[arg(long, requires = "emit")]
    ack: bool,

    /// CA certificate path for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate path for mTLS
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Client key path for mTLS (not needed for P12)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// P12 password (for PKCS#12 format client cert)
    #[arg(long)]
    p12_password: Option<String>,

    /// Skip TLS certificate verification (DEVELOPMENT ONLY)
    #[arg(long, default_value = "false")]
    insecure: bool,
}

/// `--emit` 单次发送的进度
struct OneShot {
    event: String,
    data: Option<Value>,
    ack: bool,
    sent: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&args);
    info!("Starting tickio client for {}", config.url);
    let client = SocketClient::new(config)?;
    register_handlers(&client);

    let one_shot = match &args.emit {
        Some(event) => Some(OneShot {
            event: event.clone(),
            data: args
                .data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("--data is not valid JSON")?,
            ack: args.ack,
            sent: false,
        }),
        None => None,
    };

    // 宿主循环跑在独立的单线程运行时上，客户端 I/O 在自己的运行时里
    let host = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    client.connect();
    let outcome = host.block_on(run(&client, &args, one_shot));

    // 在运行时之外关闭，等待后台任务退出
    client.close();
    info!("Client stopped");
    outcome
}

fn build_config(args: &Args) -> SocketConfig {
    let mut config = SocketConfig::from_env();
    if let Some(url) = &args.url {
        config.url = url.clone();
    }
    config.tls = TlsConfig {
        ca_cert_path: args.ca_cert.clone(),
        client_cert_path: args.client_cert.clone(),
        client_key_path: args.client_key.clone(),
        client_p12_password: args.p12_password.clone(),
        danger_accept_invalid_certs: args.insecure,
    };
    config
}

fn register_handlers(client: &SocketClient) {
    for name in ["open", "close", "connect", "disconnect"] {
        client.on(
            name,
            Arc::new(|event: &SocketIoEvent| info!("[tickio] {}", event.name())),
        );
    }
    client.on(
        "error",
        Arc::new(|event: &SocketIoEvent| match event.data() {
            Some(data) => warn!("[tickio] error: {}", data),
            None => warn!("[tickio] error"),
        }),
    );
    client.on(
        "boop",
        Arc::new(|event: &SocketIoEvent| match event.data() {
            Some(data) => info!("[tickio] boop: {}", data),
            None => info!("[tickio] boop"),
        }),
    );
}

async fn run(client: &SocketClient, args: &Args, mut one_shot: Option<OneShot>) -> Result<()> {
    let tick_period = Duration::from_secs_f64(1.0 / f64::from(args.tick_hz.max(1)));
    let mut ticker = tokio::time::interval(tick_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let beep_period = Duration::from_secs_f64(args.beep_interval.max(0.01));
    let mut beeper = tokio::time::interval(beep_period);
    beeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Client running. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                info!("Received Ctrl+C, shutting down...");
                return Ok(());
            }
            _ = ticker.tick() => {
                let report = client.tick();
                if report.handler_failures > 0 {
                    error!("{} handler(s) failed this tick", report.handler_failures);
                }
                if report.acks_expired > 0 {
                    warn!("{} ack(s) expired", report.acks_expired);
                }
                if let Some(shot) = one_shot.as_mut() {
                    if step_one_shot(client, shot)? {
                        return Ok(());
                    }
                }
            }
            _ = beeper.tick(), if one_shot.is_none() => {
                if client.is_transport_connected() {
                    if let Err(e) = client.emit("beep") {
                        warn!("Beep failed: {}", e);
                    }
                }
            }
        }
    }
}

/// 推进单次发送，完成时返回 `true`
fn step_one_shot(client: &SocketClient, shot: &mut OneShot) -> Result<bool> {
    if !shot.sent {
        if !client.is_transport_connected() {
            return Ok(false);
        }
        let data = shot.data.take();
        if shot.ack {
            let event = shot.event.clone();
            let print = move |payload: Value| println!("{} ack: {}", event, payload);
            let packet_id = match data {
                Some(data) => client.emit_with_data_and_ack(&shot.event, data, print)?,
                None => client.emit_with_ack(&shot.event, print)?,
            };
            info!("Sent '{}' (ack id {})", shot.event, packet_id);
        } else {
            match data {
                Some(data) => client.emit_with_data(&shot.event, data)?,
                None => client.emit(&shot.event)?,
            }
            info!("Sent '{}'", shot.event);
        }
        shot.sent = true;
        return Ok(!shot.ack);
    }

    // Ack 被解析或过期后注册表为空
    Ok(client.pending_acks() == 0)
}
