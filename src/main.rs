//! Remote Deploy Engine - 远程部署编排引擎
//!
//! Usage:
//! - Normal mode: `remote-deploy-engine`
//! - With custom port: `remote-deploy-engine --port 19999`
//! - With custom data directory: `remote-deploy-engine --data-dir ./state`

use std::path::PathBuf;

use remote_deploy_engine::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--data-dir" if i + 1 < args.len() => {
                config.data_dir_override = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Remote Deploy Engine - 远程部署编排引擎");
    println!();
    println!("USAGE:");
    println!("    remote-deploy-engine [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>        Override the listening port (default 9877)");
    println!("    --data-dir <DIR>     Directory for the persisted profile and applications");
    println!("    -h, --help           Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    ENGINE_API_KEY       API key required in the x-api-key header");
    println!("    RUST_LOG             Log filter (default info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args();
    remote_deploy_engine::init_tracing();
    remote_deploy_engine::run(config).await
}
