//! Hold a token-budgeted conversation or summarize a document from the
//! command line.
//!
//! Reads the API key from the `OPENAI_API_KEY` environment variable and an
//! optional base URL from `OPENAI_BASE_URL`. Diagnostics go to stderr and
//! are filtered with `RUST_LOG` (default `parley_rs=info,parley=info`).
//!
//! # Examples
//!
//! ```sh
//! # Chat line by line; an empty line or EOF ends the conversation
//! parley chat --system "You are a terse dungeon master."
//!
//! # Small budget to watch old turns fall out of the window
//! parley chat --max-context 2048 --reserve 256 --show-usage
//!
//! # Summarize a scraped page, however large
//! parley summarize page.txt --task "List the monsters mentioned above."
//!
//! # Pipe content from stdin and condense the joined summaries
//! curl -s https://example.com | parley summarize --condense
//! ```

use clap::{Args, Parser, Subcommand};
use parley_rs::context::summarizer::DEFAULT_TASK;
use parley_rs::prelude::*;
use std::io::Read;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "parley", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive conversation over stdin.
    Chat(ChatArgs),
    /// Summarize a file (or stdin) of any size.
    Summarize(SummarizeArgs),
}

#[derive(Args)]
struct ChatArgs {
    /// System prompt, always sent ahead of the history
    #[arg(long, default_value = "")]
    system: String,

    #[arg(long, default_value = parley_rs::DEFAULT_MODEL)]
    model: String,

    /// Maximum tokens per request, prompt and reply together
    #[arg(long, default_value_t = 8_192)]
    max_context: usize,

    /// Tokens kept free for the reply
    #[arg(long, default_value_t = 450)]
    reserve: usize,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Maximum tokens in each reply
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Send the newest message even when it alone exceeds the budget
    #[arg(long)]
    allow_overflow: bool,

    /// Print token usage after every reply
    #[arg(long)]
    show_usage: bool,
}

#[derive(Args)]
struct SummarizeArgs {
    /// File to summarize; reads stdin when omitted
    path: Option<String>,

    /// Instruction given with every chunk
    #[arg(long, default_value = DEFAULT_TASK)]
    task: String,

    /// Model tried first
    #[arg(long, default_value = "gpt-4")]
    short_model: String,

    #[arg(long, default_value_t = 8_192)]
    short_context: usize,

    /// Model used when the content does not fit the short one
    #[arg(long, default_value = "gpt-4-32k")]
    long_model: String,

    #[arg(long, default_value_t = 32_768)]
    long_context: usize,

    #[arg(long, default_value_t = 450)]
    reserve: usize,

    /// Summarize the joined chunk summaries once more when they fit
    #[arg(long)]
    condense: bool,
}

// ── Helpers ────────────────────────────────────────────────────────

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley_rs=info,parley=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn backend() -> Result<Arc<ResilientClient>, Error> {
    let config = ClientConfig::from_env()?;
    Ok(Arc::new(ResilientClient::from_config(config)?))
}

fn read_content(path: Option<&str>) -> Result<String, String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read '{path}': {e}")),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            Ok(buf)
        }
    }
}

/// Short user-facing text for a failed round.
fn describe(error: &Error) -> String {
    match error.request_kind() {
        Some(ErrorKind::Decode) => "the API returned something unexpected; try again".into(),
        Some(_) => format!("the request failed, try again ({error})"),
        None => error.to_string(),
    }
}

// ── Commands ───────────────────────────────────────────────────────

async fn run_chat(args: ChatArgs) -> Result<(), String> {
    let profile = ModelProfile::new(&args.model, args.max_context, args.reserve);
    let counter = Arc::new(TokenCounter::for_model(&args.model).map_err(|e| e.to_string())?);
    let state = ConversationState::new(&profile, &args.system, vec![]);

    let hyperparameters = Hyperparameters {
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        ..Default::default()
    };

    let overflow = if args.allow_overflow {
        OverflowPolicy::IncludeNewest
    } else {
        OverflowPolicy::Reject
    };
    let usage_printer = FnEventHandler::new(|event| {
        if let SessionEvent::TokenUsage {
            prompt_tokens,
            completion_tokens,
        } = event
        {
            eprintln!("  [tokens: {prompt_tokens} prompt + {completion_tokens} completion]");
        }
    });
    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with_if(args.show_usage, usage_printer);

    let session = ChatSession::new(backend().map_err(|e| e.to_string())?, counter, state)
        .with_overflow(overflow)
        .with_hyperparameters(hyperparameters)
        .with_event_handler(handler);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprint!("> ");
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| format!("failed to read stdin: {e}"))?
    {
        if line.trim().is_empty() {
            break;
        }
        match session.chat_round(&line).await {
            Ok(reply) => println!("{reply}\n"),
            Err(e) => eprintln!("Error: {}", describe(&e)),
        }
        eprint!("> ");
    }

    eprintln!("{}", session.usage().await.summary());
    Ok(())
}

async fn run_summarize(args: SummarizeArgs) -> Result<(), String> {
    let content = read_content(args.path.as_deref())?;
    let short = ModelProfile::new(&args.short_model, args.short_context, args.reserve);
    let long = ModelProfile::new(&args.long_model, args.long_context, args.reserve);
    let counter = Arc::new(TokenCounter::for_model(&args.short_model).map_err(|e| e.to_string())?);

    let merge = if args.condense {
        MergePolicy::Condense
    } else {
        MergePolicy::Concatenate
    };
    let summarizer = RecursiveSummarizer::new(backend().map_err(|e| e.to_string())?, counter)
        .with_models(short, long)
        .with_config(SummarizerConfig::default().with_merge(merge));

    let summary = summarizer
        .summarize_detailed(&content, &args.task)
        .await
        .map_err(|e| describe(&e))?;
    tracing::info!(
        "Summary used {} call(s), split depth {}",
        summary.leaf_calls,
        summary.depth
    );
    println!("{}", summary.text);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Command::Chat(args) => run_chat(args).await,
        Command::Summarize(args) => run_summarize(args).await,
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
