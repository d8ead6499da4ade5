use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use simscribe_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use simscribe_contracts::models::ModelRegistry;
use simscribe_engine::{
    default_provider_registry, Credentials, EngineConfig, GenerationRequest, PipelineUpdate,
    RunCoordinator, RunOutcome, ScriptEngine,
};

#[derive(Debug, Parser)]
#[command(name = "simscribe", version, about = "Simulation script generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One-shot generation from a prompt (and optional sketch image).
    Generate(GenerateArgs),
    /// Interactive session: describe a simulation, attach sketches, rerun.
    Chat(ChatArgs),
    /// List the registered models and their capabilities.
    Models(ModelsArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    /// Replace the built-in framework documentation with a file.
    #[arg(long)]
    docs: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    docs: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ModelsArgs {}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("simscribe error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Models(_) => {
            run_models()?;
            Ok(0)
        }
    }
}

fn build_engine(
    out: &PathBuf,
    events: Option<&PathBuf>,
    docs: Option<&PathBuf>,
) -> Result<ScriptEngine> {
    let events_path = events
        .cloned()
        .unwrap_or_else(|| out.join("events.jsonl"));
    let mut config = EngineConfig::new(out, Credentials::from_env());
    if let Some(docs_path) = docs {
        let text = fs::read_to_string(docs_path)
            .with_context(|| format!("reading documentation file {}", docs_path.display()))?;
        config = config.with_documentation(text);
    }
    Ok(ScriptEngine::new(config, events_path)?)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let engine = build_engine(&args.out, args.events.as_ref(), args.docs.as_ref())?;
    let coordinator = RunCoordinator::new();
    let token = coordinator.begin();
    let request = GenerationRequest {
        user_text: args.prompt,
        image_path: args.image,
        model: args.model,
    };

    let (sender, receiver) = mpsc::channel();
    let printer = thread::spawn(move || {
        for update in receiver {
            if shown_in_one_shot(&update) {
                print_update(&update);
            }
        }
    });

    let outcome = engine.run(&request, &token, Some(&sender));
    drop(sender);
    let _ = printer.join();

    match outcome? {
        RunOutcome::Completed { .. } => Ok(0),
        RunOutcome::Superseded => Ok(2),
    }
}

fn run_models() -> Result<i32> {
    for line in model_lines(&Credentials::from_env()) {
        println!("{line}");
    }
    Ok(0)
}

/// Renders the registry listing directly; listing models must not create
/// directories or append to any event log.
fn model_lines(credentials: &Credentials) -> Vec<String> {
    let providers = default_provider_registry(credentials);
    let mut lines = vec![format!("providers: {}", providers.labels().join(", "))];
    for spec in ModelRegistry::new(None).list() {
        let key = if credentials.has(spec.provider) {
            "key set"
        } else {
            "no key"
        };
        lines.push(format!(
            "{:<20} {:<12} [{}] ({key})",
            spec.name,
            spec.provider.family_label(),
            spec.capabilities.join(", "),
        ));
    }
    lines
}

/// One-shot mode reports failure through the error banner and exit code,
/// so the RunFailed update is not printed a second time.
fn shown_in_one_shot(update: &PipelineUpdate) -> bool {
    !matches!(update, PipelineUpdate::RunFailed(_))
}

struct ChatSession {
    out_dir: PathBuf,
    events: Option<PathBuf>,
    docs: Option<PathBuf>,
    model: Option<String>,
    image: Option<PathBuf>,
    engine: Arc<ScriptEngine>,
    coordinator: RunCoordinator,
}

impl ChatSession {
    fn rebuild_engine(&mut self) -> Result<()> {
        self.engine = Arc::new(build_engine(
            &self.out_dir,
            self.events.as_ref(),
            self.docs.as_ref(),
        )?);
        Ok(())
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let engine = Arc::new(build_engine(
        &args.out,
        args.events.as_ref(),
        args.docs.as_ref(),
    )?);
    let mut session = ChatSession {
        out_dir: args.out,
        events: args.events,
        docs: args.docs,
        model: args.model,
        image: None,
        engine,
        coordinator: RunCoordinator::new(),
    };

    println!("Simscribe chat started. Type /help for commands.");
    println!(
        "Event log: {}",
        session.engine.event_writer().path().display()
    );

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "quit" => break,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "list_models" => {
                for spec in session.engine.models() {
                    println!(
                        "{:<20} {:<12} [{}]",
                        spec.name,
                        spec.provider.family_label(),
                        spec.capabilities.join(", ")
                    );
                }
            }
            "status" => {
                println!("out dir: {}", session.out_dir.display());
                println!(
                    "model:   {}",
                    session.model.as_deref().unwrap_or("(default)")
                );
                match &session.image {
                    Some(path) => println!("sketch:  {}", path.display()),
                    None => println!("sketch:  (none)"),
                }
                println!(
                    "docs:    {}",
                    session
                        .docs
                        .as_ref()
                        .map(|path| path.display().to_string())
                        .unwrap_or_else(|| "(built-in)".to_string())
                );
            }
            "set_model" => match value_as_non_empty_string(intent.command_args.get("value")) {
                Some(model) => {
                    println!("Model set to {model}");
                    session.model = Some(model);
                }
                None => {
                    session.model = None;
                    println!("Model reset to default");
                }
            },
            "set_docs" => match value_as_non_empty_string(intent.command_args.get("value")) {
                Some(path_text) => {
                    session.docs = Some(PathBuf::from(&path_text));
                    match session.rebuild_engine() {
                        Ok(()) => println!("Documentation loaded from {path_text}"),
                        Err(err) => {
                            session.docs = None;
                            println!("Docs change failed: {err:#}");
                        }
                    }
                }
                None => {
                    session.docs = None;
                    session.rebuild_engine()?;
                    println!("Documentation reset to built-in");
                }
            },
            "attach_image" => match value_as_non_empty_string(intent.command_args.get("path")) {
                Some(path_text) => {
                    let path = PathBuf::from(&path_text);
                    match image::image_dimensions(&path) {
                        Ok((width, height)) => {
                            println!("Sketch attached: {path_text} ({width}x{height})");
                            session.image = Some(path);
                        }
                        Err(err) => println!("Cannot read image {path_text}: {err}"),
                    }
                }
                None => {
                    session.image = None;
                    println!("Sketch detached");
                }
            },
            "set_out_dir" => match value_as_non_empty_string(intent.command_args.get("path")) {
                Some(path_text) => {
                    session.out_dir = PathBuf::from(&path_text);
                    match session.rebuild_engine() {
                        Ok(()) => println!("Output directory set to {path_text}"),
                        Err(err) => println!("Out dir change failed: {err:#}"),
                    }
                }
                None => println!("/out requires a directory path"),
            },
            "save_as" => {
                if let Err(err) = save_as(&session, &intent.command_args) {
                    println!("Save failed: {err:#}");
                }
            }
            "generate" => {
                let Some(prompt) = intent.prompt.clone() else {
                    continue;
                };
                spawn_generation(&session, prompt);
            }
            "unknown_command" => {
                println!(
                    "Unknown command: {}. Type /help for the command list.",
                    intent.raw.trim()
                );
            }
            other => {
                println!("Unhandled action: {other}");
            }
        }
    }

    Ok(())
}

/// Runs one generation on a worker thread so the prompt stays responsive.
/// Starting another run invalidates this one's token; the superseded run
/// stops at its next stage boundary without writing anything.
fn spawn_generation(session: &ChatSession, prompt: String) {
    let engine = Arc::clone(&session.engine);
    let token = session.coordinator.begin();
    let request = GenerationRequest {
        user_text: prompt,
        image_path: session.image.clone(),
        model: session.model.clone(),
    };

    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        for update in receiver {
            print_update(&update);
        }
    });
    thread::spawn(move || {
        // Failures surface through the RunFailed update; nothing to add here.
        let _ = engine.run(&request, &token, Some(&sender));
    });
}

fn save_as(session: &ChatSession, args: &std::collections::BTreeMap<String, Value>) -> Result<()> {
    let target = value_as_non_empty_string(args.get("target"))
        .context("/saveas requires a target: scenario or simulation")?;
    let path_text =
        value_as_non_empty_string(args.get("path")).context("/saveas requires a destination path")?;

    let source = match target.as_str() {
        "scenario" => session.engine.scenario_path(),
        "simulation" => session.engine.simulation_path(),
        other => anyhow::bail!("unknown /saveas target '{other}' (use scenario or simulation)"),
    };
    let content = fs::read_to_string(&source)
        .with_context(|| format!("no generated script at {}", source.display()))?;
    let destination = PathBuf::from(&path_text);
    session.engine.save_script_as(&destination, &content)?;
    println!("Saved {target} script to {path_text}");
    Ok(())
}

fn print_update(update: &PipelineUpdate) {
    match update {
        PipelineUpdate::Status(text) => println!("[status] {text}"),
        PipelineUpdate::ImageAnalysis(text) => {
            println!("[sketch] {text}");
        }
        PipelineUpdate::CombinedReply { model, text } => {
            println!("[reply from {model}]\n{text}");
        }
        PipelineUpdate::ScriptExtracted { filename, body } => {
            println!("[extracted {filename}: {} lines]", body.lines().count());
        }
        PipelineUpdate::ScriptSaved {
            path,
            lines_added,
            lines_removed,
        } => {
            println!(
                "[saved] {} (+{lines_added} -{lines_removed})",
                path.display()
            );
        }
        PipelineUpdate::RunSuperseded => {
            println!("[run superseded by a newer request; nothing written]");
        }
        PipelineUpdate::RunFailed(detail) => {
            println!("[generation failed] {detail}");
        }
        PipelineUpdate::RunFinished {
            scenario_path,
            simulation_path,
        } => {
            println!(
                "[done] {} and {}",
                scenario_path.display(),
                simulation_path.display()
            );
        }
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .map(str::to_string)
        .filter(|text| !text.is_empty())
}
