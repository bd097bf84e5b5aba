mod config;
mod dataset;
mod error;
mod model;
mod operators;
mod response;
mod schemas;
mod service;
mod tracking;
mod tree;

use clap::{Args, Parser, Subcommand};
use config::Config;
use dataset::Dataset;
use error::Error;
use model::{ForestParams, RandomForest};
use rand::{rngs::StdRng, SeedableRng};
use service::service::Service;
use service::start_infer_service;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tree::TreeParams;

#[derive(Parser, Debug)]
#[command(name = "discount-predictor", version, about = "Bulk discount prediction service")]
struct Cli {
    /// TOML config file; every key is optional
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the model and serve `POST /predict`
    Serve(ServeArgs),
    /// Train a model on synthetic orders and save it
    Train(TrainArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    model: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long)]
    model: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    samples: Option<usize>,
    #[arg(long)]
    estimators: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.logging.init();

    let result = match cli.command {
        Command::Serve(args) => {
            apply_serve_args(&mut config, args);
            serve(config).await
        }
        Command::Train(args) => {
            apply_train_args(&mut config, args);
            train(config).map(|_| ())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn apply_serve_args(config: &mut Config, args: ServeArgs) {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(model) = args.model {
        config.server.model_path = model;
    }
}

fn apply_train_args(config: &mut Config, args: TrainArgs) {
    if let Some(model) = args.model {
        config.server.model_path = model;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
    }
    if let Some(samples) = args.samples {
        config.training.samples = samples;
    }
    if let Some(estimators) = args.estimators {
        config.training.n_estimators = estimators;
    }
}

async fn serve(config: Config) -> Result<(), Error> {
    let addr = config.server.socket_addr()?;

    // 加载模型, 模型必须在监听之前就绪
    info!(model = %config.server.model_path.display(), "loading model");
    let service = Service::from_path(&config.server.model_path)?;

    // 启动推断服务, Ctrl-C 时停止
    start_infer_service(service, addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await
}

/// Generates data, fits the forest, records the run and saves the model. Returns held-out accuracy.
fn train(config: Config) -> Result<f64, Error> {
    let training = &config.training;
    training.validate()?;

    let mut rng = StdRng::seed_from_u64(training.seed);
    let data = Dataset::synthetic(training.samples, &mut rng);
    let (train_set, test_set) = data.split(training.test_fraction, &mut rng);
    info!(
        train = train_set.len(),
        test = test_set.len(),
        "generated training data"
    );

    let params = ForestParams {
        n_estimators: training.n_estimators,
        tree: TreeParams {
            max_depth: (training.max_depth > 0).then_some(training.max_depth),
            min_samples_split: training.min_samples_split,
        },
    };

    let mut run = tracking::Run::start(&training.tracking_dir, &training.experiment);
    run.log_param("n_estimators", training.n_estimators);
    run.log_param("max_depth", training.max_depth);
    run.log_param("min_samples_split", training.min_samples_split);
    run.log_param("samples", training.samples);
    run.log_param("test_fraction", training.test_fraction);
    run.log_param("seed", training.seed);

    let model = RandomForest::fit(&train_set, params, &mut rng)?;
    let accuracy = model.score(&test_set)?;
    run.log_metric("accuracy", accuracy);

    let log_path = run.log_path().to_path_buf();
    run.finish()?;
    info!(experiment = %training.experiment, runs = %log_path.display(), accuracy, "run recorded");

    model.save(&config.server.model_path)?;
    info!(model = %config.server.model_path.display(), "model saved");
    println!("Model trained. Accuracy: {accuracy:.2}");

    Ok(accuracy)
}

#[test]
fn test_cli_parsing() {
    let cli = Cli::try_parse_from([
        "discount-predictor",
        "serve",
        "--port",
        "9001",
        "--model",
        "m.json",
    ])
    .unwrap();
    let Command::Serve(args) = cli.command else {
        panic!("expected serve");
    };
    let mut config = Config::default();
    apply_serve_args(&mut config, args);
    assert_eq!(config.server.port, 9001);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.model_path, PathBuf::from("m.json"));

    assert!(Cli::try_parse_from(["discount-predictor", "serve", "--port", "99999"]).is_err());
}

#[test]
fn test_train_writes_model_and_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.model_path = dir.path().join("app").join("model.json");
    config.training.tracking_dir = dir.path().join("mlruns");
    config.training.samples = 300;

    let accuracy = train(config.clone()).unwrap();
    assert!(accuracy >= 0.85);

    let model = RandomForest::load(&config.server.model_path).unwrap();
    assert_eq!(model.n_estimators(), 50);
    let runs = std::fs::read_to_string(
        dir.path()
            .join("mlruns")
            .join("bulk-discount-model")
            .join("runs.jsonl"),
    )
    .unwrap();
    assert_eq!(runs.lines().count(), 1);

    // same seed, same model
    let again = dir.path().join("again.json");
    config.server.model_path = again.clone();
    assert_eq!(train(config).unwrap(), accuracy);
    assert_eq!(RandomForest::load(again).unwrap(), model);
}

#[test]
fn test_train_rejects_invalid_config() {
    let mut config = Config::default();
    config.training.n_estimators = 0;
    assert!(matches!(train(config), Err(Error::Config(_))));
}

#[tokio::test]
async fn test_serve_fails_without_model() {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".into();
    config.server.model_path = PathBuf::from("/nonexistent/model.json");
    assert!(matches!(serve(config).await, Err(Error::Model(_))));
}
