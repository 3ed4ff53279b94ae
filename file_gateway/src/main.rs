mod gateway;

use log::error;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use std::env;
use std::path::PathBuf;

use crate::gateway::{run_gateway, GatewayRunOptions, DEFAULT_GATEWAY_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: file_gateway [--config <path>] [--listen <addr>] [--data-dir <path>] [--save-multiple]\n\
         defaults:\n\
         --config {}\n\
         the other flags override the loaded config file",
        DEFAULT_GATEWAY_CONFIG_PATH
    )
}

fn parse_args() -> Result<GatewayRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.first().map(|a| a.as_str()) == Some("-h") || args.first().map(|a| a.as_str()) == Some("--help") {
        return Err(usage());
    }

    let mut options = GatewayRunOptions {
        config_path: PathBuf::from(DEFAULT_GATEWAY_CONFIG_PATH),
        listen: None,
        data_dir: None,
        save_multiple: false,
    };

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                options.config_path = PathBuf::from(value);
            }
            "--listen" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --listen".to_string())?;
                options.listen = Some(value.clone());
            }
            "--data-dir" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --data-dir".to_string())?;
                options.data_dir = Some(PathBuf::from(value));
            }
            "--save-multiple" => {
                options.save_multiple = true;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(options)
}

fn init_logging() {
    if TermLogger::init(
        LevelFilter::Info,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        let _ = simplelog::SimpleLogger::init(LevelFilter::Info, LogConfig::default());
    }
}

fn main() {
    init_logging();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_gateway(options) {
        error!("run file_gateway failed: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod gateway_tests;
