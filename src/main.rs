use anyhow::Context;
use clap::Parser;
use cube_vision::utils::error::ErrorCategory;
use cube_vision::utils::{logger, validation::Validate};
use cube_vision::{CliArgs, CubeVisionConfig, FacePipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // 初始化日誌
    if args.log_json {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("Starting cube-vision CLI");
    if args.verbose {
        tracing::debug!("CLI args: {:?}", args);
    }

    let mut config = match &args.config {
        Some(path) => CubeVisionConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CubeVisionConfig::default(),
    };
    args.apply_overrides(&mut config);

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("reading image {}", args.image.display()))?;
    let pipeline = FacePipeline::new(&config)?;

    let cancel = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // no signal handler available, never cancel
            std::future::pending::<()>().await;
        }
        tracing::warn!("Interrupt received, cancelling");
    };

    match pipeline.classify_until(bytes, cancel).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Err(e) => {
            tracing::error!(
                "❌ Classification failed: {} (Category: {:?}, Status: {})",
                e,
                e.category(),
                e.http_status()
            );
            eprintln!("❌ {}", e.user_friendly_message());

            // 根據錯誤類別決定退出碼
            let exit_code = match e.category() {
                ErrorCategory::Input | ErrorCategory::Schema => 2,
                ErrorCategory::Upstream | ErrorCategory::UpstreamContract => 3,
                ErrorCategory::Cancelled => 130,
                ErrorCategory::Configuration => 1,
                ErrorCategory::Internal => 4,
            };
            std::process::exit(exit_code);
        }
    }

    Ok(())
}
