use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tonic::transport::Server;

use xvision::grpc::scan_analyzer_server::ScanAnalyzerServer;
use xvision::{
    Analyzer, AnalyzerConfig, Args, ModelConfig, PipelineError, ScanAnalyzerService, overlay,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = AnalyzerConfig {
        cuda: args.cuda,
        polarity: args.polarity,
        model: ModelConfig {
            probability_output: args.prob_output.clone(),
            feature_output: args.feature_output.clone(),
            channels_last: !args.channels_first,
        },
        ..AnalyzerConfig::default()
    };

    // Model-load failure is fatal: nothing can be served without a model.
    let analyzer = Arc::new(Analyzer::from_file(&args.model, config)?);

    if args.serve {
        let addr = format!("[::]:{}", args.port).parse()?;
        log::info!("ScanAnalyzer server listening on {addr}");
        Server::builder()
            .add_service(ScanAnalyzerServer::new(ScanAnalyzerService::open(analyzer)))
            .serve(addr)
            .await?;
        return Ok(());
    }

    let source = args
        .source
        .context("--source is required unless --serve is set")?;
    let image =
        image::open(&source).map_err(|e| PipelineError::Preprocess(e.to_string()))?;

    let report = analyzer.analyze(&image)?;
    println!(
        "Label: {}, Confidence: {:.1}%",
        report.prediction.label,
        report.prediction.confidence * 100.0
    );

    if let Some(overlay_img) = &report.overlay {
        fs::create_dir_all(&args.output)?;
        let path = Path::new(&args.output).join(overlay::DOWNLOAD_FILENAME);
        overlay_img
            .save(&path)
            .map_err(|e| PipelineError::Overlay(e.to_string()))?;
        println!("Overlay written to {}", path.display());
    }

    Ok(())
}
