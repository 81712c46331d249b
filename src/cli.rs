use clap::Parser;

use crate::model::LabelPolarity;

#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// ONNX model path
    #[arg(long, required = true)]
    pub model: String,

    /// image path (one-shot analysis; omit with --serve)
    #[arg(long)]
    pub source: Option<String>,

    /// directory for the overlay PNG in one-shot mode
    #[arg(long, default_value_t = String::from("output"))]
    pub output: String,

    /// start the gRPC server instead of analyzing a single file
    #[arg(long, default_value_t = false)]
    pub serve: bool,

    /// gRPC listen port
    #[arg(long, default_value_t = 50051)]
    pub port: u16,

    #[arg(long, default_value_t = false)]
    pub cuda: bool,

    /// label convention for this deployment
    #[arg(long, value_enum, default_value_t = LabelPolarity::NormalAbnormal)]
    pub polarity: LabelPolarity,

    /// name of the model's probability output
    #[arg(long, default_value_t = String::from("probability"))]
    pub prob_output: String,

    /// name of the model's late convolutional feature-map output
    #[arg(long, default_value_t = String::from("conv_features"))]
    pub feature_output: String,

    /// set when the feature map is exported channels-first (NCHW)
    #[arg(long, default_value_t = false)]
    pub channels_first: bool,
}
