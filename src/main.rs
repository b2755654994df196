use std::path::PathBuf;

use clap::Parser;
use packed_gru::{
    BatchProfile, DirectionMode, GoldenCase, GruConfig, GruError, InputMode, ReferenceCase,
    Tolerance, verify, verify_snapshot,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Parser, Debug)]
#[command(name = "packed-gru")]
#[command(about = "Run the packed-batch GRU reference passes on a random case")]
struct Args {
    #[arg(long, default_value_t = 8)]
    hidden_size: usize,

    #[arg(long, default_value_t = 2)]
    num_layers: usize,

    /// Input vector length (must equal the hidden size with --skip)
    #[arg(long, default_value_t = 8)]
    input_width: usize,

    #[arg(long, default_value_t = 5)]
    seq_len: usize,

    /// Active rows at the first timestep
    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    #[arg(long)]
    bidirectional: bool,

    #[arg(long)]
    biased: bool,

    /// Feed the input straight into the first layer's gates
    #[arg(long)]
    skip: bool,

    /// Every timestep keeps all rows instead of a random shrinking profile
    #[arg(long)]
    uniform: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the finished case as a golden snapshot (.json or .bin)
    #[arg(long)]
    save: Option<PathBuf>,

    /// Verify a golden snapshot instead of generating a case
    #[arg(long, conflicts_with = "save")]
    load: Option<PathBuf>,

    /// Relative RMS threshold for --load
    #[arg(long)]
    tolerance: Option<f64>,
}

impl Args {
    fn config(&self) -> GruConfig {
        GruConfig::new(self.hidden_size, self.num_layers, self.input_width)
            .with_direction(if self.bidirectional {
                DirectionMode::Bidirectional
            } else {
                DirectionMode::Unidirectional
            })
            .with_bias(self.biased)
            .with_input_mode(if self.skip {
                InputMode::Skip
            } else {
                InputMode::Linear
            })
    }
}

fn main() -> packed_gru::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let tolerance = args.tolerance.map(Tolerance::new).unwrap_or_default();

    if let Some(path) = &args.load {
        let error = verify_snapshot(path, tolerance)?;
        println!("{} reproduced (relative RMS error {:e})", path.display(), error);
        return Ok(());
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let profile = if args.uniform {
        BatchProfile::uniform(args.batch_size, args.seq_len)?
    } else {
        BatchProfile::random(&mut rng, args.batch_size, args.seq_len)?
    };
    println!("Batch profile: {:?}", profile.counts());

    let case = ReferenceCase::random(args.config(), profile, &mut rng)?;
    let golden = GoldenCase::record(case)?;

    // a second forward over the same inputs must be bit-identical
    let gru = golden.case.engine()?;
    let rerun = gru.forward(&golden.case.weights, &golden.case.input, &golden.case.hx)?;
    verify("output", &golden.outputs.output, &rerun.output, Tolerance::exact()).map_err(|_| {
        GruError::Verification {
            message: "forward pass is not deterministic".to_string(),
        }
    })?;
    verify("hy", &golden.outputs.hy, &rerun.hy, Tolerance::exact())?;

    println!(
        "params={} reserve={} workspace={} output={}",
        gru.params_len(),
        gru.reserve_len(),
        gru.workspace_len(),
        gru.output_len()
    );
    println!("Forward pass deterministic across repeated runs");

    if let Some(path) = &args.save {
        golden.save(path, Some(format!("seed {}", args.seed)))?;
        println!("Saved golden case to {}", path.display());
    }

    Ok(())
}
