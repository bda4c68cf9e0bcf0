use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use chatrelay_core_sdk::prelude::*;

/**
 * \brief Command line entry: runs the relay server or talks to a profile directly.
 */
#[derive(Parser, Debug)]
#[command(name = "chatrelay", version, about = "Personal chat relay for OpenAI-compatible APIs")]
struct Cli {
    /** \brief SQLite file; overrides CHATRELAY_DATABASE_PATH. */
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /** \brief Start the HTTP relay and the static UI. */
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },

    /** \brief Manage saved upstream profiles. */
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /** \brief List the models a profile's upstream offers. */
    Models {
        #[arg(long)]
        profile: i64,
    },

    /**
     * \brief Send one user message through the relay pipeline.
     * \details With `--conversation` the stored thread is replayed first, the
     *          way the web UI sends it. The turn is stored exactly as if it came
     *          over HTTP.
     */
    Chat {
        #[arg(long)]
        profile: i64,
        #[arg(long)]
        conversation: Option<i64>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt: String,
        /** \brief Ask for a single JSON completion instead of a stream. */
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        api_base: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        system_prompt: Option<String>,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    let _telemetry = telemetry::init(&config)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            server::run(config).await?;
        }
        Commands::Profile { action } => {
            let conn = server::AppState::new(config)?.open_db()?;
            match action {
                ProfileAction::Add {
                    name,
                    api_base,
                    api_key,
                    model,
                    temperature,
                    system_prompt,
                } => {
                    let settings = GenerationSettings {
                        model,
                        temperature,
                        system_prompt,
                        ..Default::default()
                    };
                    if let Err(msg) = settings.validate() {
                        bail!("invalid settings: {msg}");
                    }
                    let id = db::insert_profile(
                        &conn,
                        &NewProfile {
                            name: name.clone(),
                            api_base_url: api_base.clone(),
                            api_key,
                            settings,
                        },
                    )
                    .context("save profile failed")?;
                    println!("Saved profile id={} (name={} | {})", id, name, api_base);
                }
                ProfileAction::List => {
                    for p in db::list_profiles(&conn).context("load profiles failed")? {
                        let model = p.settings.model.as_deref().unwrap_or("-");
                        println!("{}\t{}\t{}\t{}", p.id, p.name, p.api_base_url, model);
                    }
                }
            }
        }
        Commands::Models { profile } => {
            let state = server::AppState::new(config)?;
            let profile = {
                let conn = state.open_db()?;
                db::get_profile(&conn, profile)?
                    .with_context(|| format!("profile {profile} not found"))?
            };
            let models = llm::list_models(&state.client, &profile).await?;
            for m in models {
                match m.get("id").and_then(|v| v.as_str()).or_else(|| m.as_str()) {
                    Some(id) => println!("{id}"),
                    None => println!("{m}"),
                }
            }
        }
        Commands::Chat {
            profile,
            conversation,
            model,
            prompt,
            no_stream,
        } => {
            let state = server::AppState::new(config)?;
            let conn = state.open_db()?;
            let mut messages: Vec<InputMessage> = match conversation {
                Some(id) => db::load_messages(&conn, id)
                    .context("load conversation failed")?
                    .into_iter()
                    .map(|m| InputMessage::text(m.role, m.content))
                    .collect(),
                None => Vec::new(),
            };
            messages.push(InputMessage::text(Role::User, prompt));
            let request = ChatRequest {
                profile_id: profile,
                conversation_id: conversation,
                model,
                messages,
                params: GenerationSettings {
                    stream: Some(!no_stream),
                    ..Default::default()
                },
            };
            match run_chat(conn, state.client.clone(), request).await? {
                ChatOutcome::Completed(reply) => {
                    println!("{}", chatrelay_core_sdk::extract::extract_reply(&reply.response));
                    eprintln!("conversation id={}", reply.conversation_id);
                }
                ChatOutcome::Streaming(mut rx) => print_stream(&mut rx).await?,
            }
        }
    }

    Ok(())
}

async fn print_stream(rx: &mut tokio::sync::mpsc::Receiver<RelayEvent>) -> Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            RelayEvent::Meta {
                conversation_id,
                model,
            } => {
                tracing::debug!(conversation_id, %model, "stream opened");
            }
            RelayEvent::Chunk(delta) => {
                print!("{delta}");
                stdout.flush().ok();
            }
            RelayEvent::Debug(payload) => eprintln!("[debug] {payload}"),
            RelayEvent::Error(payload) => {
                println!();
                bail!("relay failed: {payload}");
            }
            RelayEvent::Done { conversation_id } => {
                println!();
                eprintln!("conversation id={conversation_id}");
            }
        }
    }
    Ok(())
}
