// Mixed-precision MNIST training; f16 on a GPU should reach ~99% accuracy.
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use candle::{DType, Device, Result, Tensor, Var};
use candle_amp::{
    BatchLoader, CrossEntropy, DataLoader, EarlyStopping, ForwardCtx, LightModule,
    ModelCheckpoint, OneCycleLr, Precision, Trainer, TrainerConfig, TrainerSettings,
};
use candle_nn::{Conv2d, Dropout, Linear, ModuleT, Optimizer, VarBuilder, VarMap};
use clap::Parser;

const LABELS: usize = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// JSON file with trainer settings. Flags that are passed override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of epochs, 10 unless set here or in the config file.
    #[arg(long)]
    epochs: Option<usize>,

    /// Peak learning rate of the one-cycle schedule.
    #[arg(long, default_value_t = 0.01)]
    learning_rate: f64,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Forward pass precision: f32, f16 or bf16. Defaults to f16.
    #[arg(long)]
    precision: Option<Precision>,

    /// Weight of an L1 penalty on all parameters.
    #[arg(long)]
    l1: Option<f64>,

    #[arg(long)]
    no_dropout: bool,

    /// Log the training loss every this many steps, 0 to disable.
    #[arg(long)]
    log_every: Option<usize>,

    /// Directory for safetensors checkpoints of the best epochs.
    #[arg(long)]
    save: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    seed: u64,
}

struct ConvNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
    varmap: VarMap,
}

impl ConvNet {
    fn new(dev: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let conv1 = candle_nn::conv2d(1, 32, 5, Default::default(), vs.pp("c1"))?;
        let conv2 = candle_nn::conv2d(32, 64, 5, Default::default(), vs.pp("c2"))?;
        let fc1 = candle_nn::linear(1024, 1024, vs.pp("fc1"))?;
        let fc2 = candle_nn::linear(1024, LABELS, vs.pp("fc2"))?;
        let dropout = Dropout::new(0.5);
        Ok(Self {
            conv1,
            conv2,
            fc1,
            fc2,
            dropout,
            varmap,
        })
    }
}

impl LightModule for ConvNet {
    fn forward_t(&self, xs: &Tensor, ctx: &ForwardCtx) -> Result<Tensor> {
        let amp = &ctx.autocast;
        let (b_sz, _img_dim) = xs.dims2()?;
        let xs = xs.reshape((b_sz, 1, 28, 28))?;
        let xs = amp.conv2d(&self.conv1, &xs)?.max_pool2d(2)?;
        let xs = amp.conv2d(&self.conv2, &xs)?.max_pool2d(2)?.flatten_from(1)?;
        let xs = amp.linear(&self.fc1, &xs)?.relu()?;
        let xs = self.dropout.forward_t(&xs, ctx.dropout_active())?;
        amp.linear(&self.fc2, &xs)
    }

    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
}

fn main() -> anyhow::Result<()> {
    candle_examples::init_tracing();
    let args = Args::parse();
    let dev = candle_examples::device(args.cpu)?;

    let m = candle_datasets::vision::mnist::load()?;
    tracing::info!(train = ?m.train_images.shape(), test = ?m.test_images.shape(), "loaded mnist");

    let train_labels = m.train_labels.to_dtype(DType::U32)?;
    let test_labels = m.test_labels.to_dtype(DType::U32)?;
    let mut train = DataLoader::new(m.train_images, train_labels, args.batch_size)?.shuffle(args.seed);
    let mut test = DataLoader::new(m.test_images, test_labels, args.batch_size)?;

    let settings = match &args.config {
        Some(path) => TrainerSettings::from_json_file(path)?,
        None => TrainerSettings {
            max_epochs: 10,
            log_every_n_steps: 100,
            precision: Precision::F16,
            dropout: true,
            ..Default::default()
        },
    };
    let mut config = TrainerConfig::from_settings(settings, dev.clone());
    if let Some(epochs) = args.epochs {
        config = config.max_epochs(epochs);
    }
    if let Some(precision) = args.precision {
        config = config.precision(precision);
    }
    if args.no_dropout {
        config = config.dropout(false);
    }
    if let Some(n) = args.log_every {
        config = config.log_every_n_steps(n);
    }
    if let Some(lambda) = args.l1 {
        config = config.l1(lambda);
    }
    tracing::info!(?dev, precision = %config.precision, epochs = config.max_epochs, "starting");
    let epochs = config.max_epochs;

    let mut model = ConvNet::new(&dev)?;
    let params = candle_nn::ParamsAdamW {
        lr: args.learning_rate,
        ..Default::default()
    };
    let mut optimizer = candle_nn::AdamW::new(model.parameters(), params)?;

    let schedule = OneCycleLr::with_epochs(args.learning_rate, epochs, train.num_batches()?);
    let mut trainer = Trainer::new(config)?
        .with_scheduler(schedule)
        .with_callback(EarlyStopping::new().monitor("val_accuracy").patience(3));
    if let Some(dir) = &args.save {
        trainer = trainer.with_callback(
            ModelCheckpoint::new(model.varmap.clone(), dir)
                .monitor("val_accuracy")
                .save_top_k(1),
        );
    }

    let history = trainer.fit(&mut model, &mut optimizer, &CrossEntropy, &mut train, Some(&mut test))?;
    let final_stats = trainer.evaluate(&model, &mut test, &CrossEntropy)?;
    println!(
        "epochs: {}, test loss: {:.4}, test accuracy: {:.2}% ({} samples), final loss scale: {}",
        history.len(),
        final_stats.loss,
        final_stats.accuracy,
        test.dataset_len()?,
        trainer.scaler().scale_value(),
    );

    Ok(())
}
