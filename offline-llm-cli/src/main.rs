#[cfg(test)]
#[path = "../tests/unit/main_test.rs"]
mod tests;

use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use offline_llm_inference::checkpoint::{CheckpointConfig, DecoderWeights, VocabEntry, write_checkpoint};
use offline_llm_inference::{
    Architecture, CancellationToken, Completion, CompletionReason, GenerationParams, LoadConfig, ModelHandle,
    Quantization, Session, StreamEvent, TruncationPolicy, load_model,
};

/// Token of the generation currently printing, cancelled by Ctrl-C.
type CurrentGeneration = Arc<Mutex<Option<CancellationToken>>>;

fn model_arg() -> Arg {
    Arg::new("model").help("Model file").required(true).index(1)
}

fn load_args(command: Command) -> Command {
    command
        .arg(model_arg())
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = model's seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_name("INT")
                .help("Inference threads [default: 4]")
                .value_parser(clap::value_parser!(usize)),
        )
}

fn generation_args(command: Command) -> Command {
    load_args(command)
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], 0 is greedy")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1]")
                .default_value("0.9")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topk")
                .short('k')
                .long("topk")
                .value_name("INT")
                .help("Top-k filtering, 0 disables it")
                .default_value("0")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("repeat-penalty")
                .long("repeat-penalty")
                .value_name("FLOAT")
                .help("Repetition penalty over the last 64 tokens, 1.0 disables it")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Maximum number of generated tokens per turn")
                .default_value("256")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("stop")
                .long("stop")
                .value_name("STRING")
                .help("Stop sequence, may be repeated")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("batch")
                .long("batch")
                .value_name("INT")
                .help("Tokens per streamed increment")
                .default_value("1")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .help("Cancel a turn after this many seconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("keep-recent")
                .long("keep-recent")
                .help("Drop the oldest tokens instead of failing when the context is full")
                .action(ArgAction::SetTrue),
        )
}

fn generate_subcommand() -> Command {
    generation_args(Command::new("generate").about("Generate a continuation of a prompt")).arg(
        Arg::new("input")
            .short('i')
            .long("input")
            .value_name("STRING")
            .help("Input prompt")
            .required(true),
    )
}

fn chat_subcommand() -> Command {
    generation_args(Command::new("chat").about("Continue one conversation over several turns read from stdin"))
}

fn info_subcommand() -> Command {
    load_args(Command::new("info").about("Print model information as JSON"))
}

fn synth_subcommand() -> Command {
    Command::new("synth")
        .about("Write a randomly initialized model with a byte-level vocabulary")
        .arg(Arg::new("output").help("Output model file").required(true).index(1))
        .arg(
            Arg::new("dim")
                .long("dim")
                .value_name("INT")
                .help("Embedding dimension")
                .default_value("64")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("layers")
                .long("layers")
                .value_name("INT")
                .help("Number of layers")
                .default_value("2")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("seq-len")
                .long("seq-len")
                .value_name("INT")
                .help("Maximum context length")
                .default_value("256")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("group-size")
                .long("group-size")
                .short('g')
                .value_name("SIZE")
                .help("Quantization group size")
                .default_value("32")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("f32")
                .long("f32")
                .help("Store full precision weights instead of Q8_0")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Weight initialization seed")
                .default_value("42")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn load(matches: &ArgMatches) -> Result<ModelHandle> {
    let path = matches.get_one::<String>("model").context("model path is required")?;
    let config = LoadConfig::builder()
        .context_window(matches.get_one::<usize>("context").copied())
        .thread_count(matches.get_one::<usize>("threads").copied())
        .build();

    load_model(path, config).with_context(|| format!("Failed to load {path}"))
}

fn generation_params(matches: &ArgMatches) -> Result<GenerationParams> {
    let truncation = matches.get_flag("keep-recent").then_some(TruncationPolicy::KeepRecent);

    let params = GenerationParams::builder()
        .temperature(matches.get_one::<f32>("temperature").copied())
        .top_p(matches.get_one::<f32>("topp").copied())
        .top_k(matches.get_one::<usize>("topk").copied())
        .repetition_penalty(matches.get_one::<f32>("repeat-penalty").copied())
        .max_new_tokens(matches.get_one::<usize>("max-tokens").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .stop_sequences(matches.get_many::<String>("stop").unwrap_or_default().cloned())
        .stream_batch(matches.get_one::<usize>("batch").copied())
        .timeout(matches.get_one::<u64>("timeout").map(|seconds| Duration::from_secs(*seconds)))
        .truncation(truncation)
        .build()?;

    Ok(params)
}

fn install_interrupt_handler() -> Result<CurrentGeneration> {
    let current: CurrentGeneration = Arc::default();
    let handler_current = current.clone();

    ctrlc::set_handler(move || {
        match handler_current.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(token) => token.cancel(),
            None => std::process::exit(130),
        }
    })
    .context("Failed to install Ctrl-C handler")?;

    Ok(current)
}

/// Prints one generation as it streams and returns how it ended.
fn stream_turn(session: &Session, prompt: &str, params: GenerationParams, current: &CurrentGeneration) -> Result<Completion> {
    let stream = session.generate(prompt, params)?;
    *current.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream.cancellation_token());

    let mut stdout = io::stdout();
    let mut completion = None;
    for event in stream {
        match event {
            StreamEvent::Increment(increment) => {
                print!("{}", increment.text);
                stdout.flush()?;
            }
            StreamEvent::Finished(finished) => completion = Some(finished),
        }
    }
    println!();

    current.lock().unwrap_or_else(PoisonError::into_inner).take();
    let completion = completion.context("generation ended without completion")?;

    let stats = &completion.stats;
    info!(
        "{:?}: {} prompt tokens, {} generated tokens, {:.2} tokens/sec",
        completion.reason,
        stats.prompt_tokens,
        stats.generated_tokens,
        stats.tokens_per_second()
    );

    Ok(completion)
}

fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let current = install_interrupt_handler()?;
    let params = generation_params(matches)?;
    let prompt = matches.get_one::<String>("input").context("input prompt is required")?;

    let handle = load(matches)?;
    let session = Session::open(&handle)?;

    let completion = stream_turn(&session, prompt, params, &current)?;
    if let CompletionReason::Failed(e) = completion.reason {
        anyhow::bail!("Generation failed: {e}");
    }

    Ok(())
}

fn run_chat_command(matches: &ArgMatches) -> Result<()> {
    let current = install_interrupt_handler()?;
    let params = generation_params(matches)?;

    let handle = load(matches)?;
    let session = Session::open(&handle)?;
    let stdin = io::stdin();

    info!("Empty line quits, /reset starts a new conversation");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim_end_matches(['\r', '\n']);

        match input {
            "" => break,
            "/reset" => {
                session.reset()?;
                continue;
            }
            prompt => {
                let completion = stream_turn(&session, prompt, params.clone(), &current)?;
                if let CompletionReason::Failed(e) = completion.reason {
                    anyhow::bail!("Generation failed: {e}");
                }
            }
        }
    }

    session.close()?;
    Ok(())
}

fn run_info_command(matches: &ArgMatches) -> Result<()> {
    let handle = load(matches)?;
    let info = handle.info().context("model is not loaded")?;
    println!("{}", info.to_json()?);
    Ok(())
}

fn run_synth_command(matches: &ArgMatches) -> Result<()> {
    let output = matches.get_one::<String>("output").context("output path is required")?;
    let dim = *matches.get_one::<usize>("dim").context("dim is required")?;
    let n_layers = *matches.get_one::<usize>("layers").context("layers is required")?;
    let seq_len = *matches.get_one::<usize>("seq-len").context("seq-len is required")?;
    let group_size = *matches.get_one::<usize>("group-size").context("group-size is required")?;
    let seed = *matches.get_one::<u64>("seed").context("seed is required")?;

    let head_dim = 16;
    if dim % head_dim != 0 {
        anyhow::bail!("dim must be a multiple of {head_dim}");
    }

    let quantization = if matches.get_flag("f32") { Quantization::F32 } else { Quantization::Q8_0 };

    // Every byte is a token, followed by BOS and EOS.
    let mut vocab: Vec<VocabEntry> = (0..=255u8).map(|byte| VocabEntry::new([byte], 0.0)).collect();
    let bos_token_id = vocab.len() as u32;
    vocab.push(VocabEntry::new("<s>", 0.0));
    vocab.push(VocabEntry::new("</s>", 0.0));

    let n_heads = dim / head_dim;
    let config = CheckpointConfig {
        quantization,
        architecture: Architecture::QkNormDecoder,
        dim,
        hidden_dim: dim * 2,
        n_layers,
        n_heads,
        n_kv_heads: if n_heads % 2 == 0 { n_heads / 2 } else { n_heads },
        head_dim,
        seq_len,
        group_size,
        shared_classifier: true,
        bos_token_id: Some(bos_token_id),
        eos_token_id: Some(bos_token_id + 1),
        rope_theta: 10000.0,
        norm_eps: 1e-6,
    };

    info!("");
    info!("Synthesizing model");
    info!("Output path: {output}");
    info!("Quantization: {quantization}, group size: {group_size}");
    info!("{config:#?}");

    let weights = DecoderWeights::seeded(&config, vocab.len(), seed, 0.1);
    write_checkpoint(Path::new(output), &config, &vocab, &weights)?;

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let matches = Command::new("offline-llm")
        .about("Offline LLM CLI: run and inspect on-device language models")
        .subcommand(generate_subcommand())
        .subcommand(chat_subcommand())
        .subcommand(info_subcommand())
        .subcommand(synth_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("generate", matches)) => run_generate_command(matches),
        Some(("chat", matches)) => run_chat_command(matches),
        Some(("info", matches)) => run_info_command(matches),
        Some(("synth", matches)) => run_synth_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
