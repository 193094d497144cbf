mod admission;
mod classifier;
mod config;
mod delay;
mod engine;
mod error;
mod message;
mod proto_utils;
#[cfg(test)]
mod test_support;
mod translate;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{RuntimeConfig, Settings, load_config, split_servers};
use crate::engine::Forwarder;

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS forwarder that filters poisoned answers", long_about = None)]
struct Args {
    /// 配置文件路径（JSON），命令行参数优先
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// IP 黑名单文件
    #[arg(short = 'l', long = "iplist")]
    iplist: Option<PathBuf>,
    /// 国内网段文件
    #[arg(short = 'c', long = "chnroute")]
    chnroute: Option<PathBuf>,
    /// 监听地址，缺省 0.0.0.0
    #[arg(short = 'b', long = "bind")]
    bind: Option<String>,
    /// 监听端口，缺省 53
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
    /// 上游 DNS，逗号分隔
    #[arg(short = 's', long = "servers")]
    servers: Option<String>,
    /// 可疑响应延迟秒数，缺省 0.3
    #[arg(short = 'y', long = "delay")]
    delay: Option<f64>,
    /// 双向过滤
    #[arg(short = 'd', long = "bidirectional", default_value_t = false)]
    bidirectional: bool,
    /// 向国外上游发送带压缩指针的查询
    #[arg(short = 'm', long = "compression", default_value_t = false)]
    compression: bool,
    /// 输出每个请求/响应的日志
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    verbose: bool,
}

impl Args {
    /// Command-line values win over the config file.
    fn into_settings(self, mut settings: Settings) -> Settings {
        if let Some(bind) = self.bind {
            settings.bind_addr = bind;
        }
        if let Some(port) = self.port {
            settings.bind_port = port;
        }
        if let Some(servers) = self.servers {
            settings.servers = split_servers(&servers);
        }
        if self.iplist.is_some() {
            settings.iplist = self.iplist;
        }
        if self.chnroute.is_some() {
            settings.chnroute = self.chnroute;
        }
        if let Some(delay) = self.delay {
            settings.delay_secs = delay;
        }
        settings.bidirectional |= self.bidirectional;
        settings.compression |= self.compression;
        settings.verbose |= self.verbose;
        settings
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let base = match &args.config {
        Some(path) => load_config(path).context("load config")?,
        None => Settings::default(),
    };
    let settings = args.into_settings(base);
    init_tracing(settings.verbose);

    let cfg = RuntimeConfig::build(settings).await.context("build runtime config")?;
    let forwarder = Forwarder::bind(cfg).context("init sockets")?;

    tokio::select! {
        res = forwarder.run() => {
            if let Err(err) = &res {
                error!(error = %err, "forwarder exited");
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
