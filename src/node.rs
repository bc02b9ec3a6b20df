use std::rc::Rc;
use std::time::Duration;

use tracing::{error, info, warn};

use ecg_link::clock::MonotonicClock;
use ecg_link::keystore::FileStore;
use ecg_link::logging::init;
use ecg_link::rng::SystemEntropy;
use ecg_link::source::SyntheticEcg;
use ecg_link::transport::UdpTransport;
use ecg_link::{NodeConfig, Pipeline, VERSION};

const DEFAULT_KEY_DIR: &str = "./ecg-keys";

fn main() {
    // 日志系统初始化
    init();

    let mut args = std::env::args();
    let cmd = args.next().unwrap_or_else(|| "ecg-node".to_string());

    let broker = match (args.next(), args.next()) {
        (Some(url), None) => url,
        _ => {
            println!("用法: {cmd} URL");
            println!("\n例如: {cmd} udp://127.0.0.1:4433");
            println!("可选环境变量: ECG_DEVICE_ID, ECG_KEY_DIR, ECG_CONNECT_TIMEOUT_MS");
            return;
        }
    };

    let config = load_config();
    let key_dir = std::env::var("ECG_KEY_DIR").unwrap_or_else(|_| DEFAULT_KEY_DIR.to_string());
    info!("ecg-node {} 启动: 代理={}, 密钥目录={}", VERSION, broker, key_dir);

    let transport = match UdpTransport::new(&broker, &config.device_id) {
        Ok(transport) => transport,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let sample_rate = sample_rate_hz(config.sampling_interval);
    let pipeline = Pipeline::bootstrap(
        config,
        FileStore::new(key_dir),
        Box::new(SystemEntropy::new()),
        transport,
        Rc::new(MonotonicClock::new()),
        Box::new(SyntheticEcg::new(sample_rate, 72)),
    );

    let mut pipeline = match pipeline {
        Ok(pipeline) => pipeline,
        Err(e) => {
            // 没有可用密钥或连接时不进入采样
            error!("启动失败: {}", e);
            std::process::exit(1);
        }
    };

    pipeline.run()
}

/// 默认配置加环境变量覆盖
fn load_config() -> NodeConfig {
    let mut config = NodeConfig::default();

    if let Ok(device_id) = std::env::var("ECG_DEVICE_ID") {
        config.device_id = device_id;
    }

    if let Ok(raw) = std::env::var("ECG_CONNECT_TIMEOUT_MS") {
        match raw.parse::<u64>() {
            Ok(ms) => config.bootstrap_connect_timeout = Some(Duration::from_millis(ms)),
            Err(e) => warn!("忽略无效的 ECG_CONNECT_TIMEOUT_MS={}: {}", raw, e),
        }
    }

    config
}

fn sample_rate_hz(interval: Duration) -> u32 {
    let ms = interval.as_millis().max(1) as u32;
    (1000 / ms).max(1)
}
