use anyhow::{Context, Result};
use apptrack::models::{
    ApplicationPatch, ApplicationStatus, CompleteApplication, NewApplication, NewContact, NewEvent,
    NewNote, NewStep,
};
use apptrack::{
    ApiClient, CacheStore, CacheValue, ClientConfig, MutationCoordinator, Notification,
    NotificationSink, QueryCoordinator, QueryKey, QueryState, QueryStatus,
};
use chrono::{DateTime, Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apptrack")]
#[command(about = "Track job applications - pipeline status, next steps, interviews and contacts")]
struct Cli {
    /// Base URL of the applications API (overrides APPTRACK_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Request timeout in seconds (overrides APPTRACK_TIMEOUT_SECS)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List applications
    List {
        /// Filter by status (saved, applied, interviewing, offer, rejected, accepted)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show application details
    Show {
        /// Application ID
        id: String,
    },

    /// Add an application
    Add {
        #[arg(short, long)]
        company: String,

        #[arg(short, long)]
        position: String,

        #[arg(short, long, default_value = "Remote")]
        location: String,

        #[arg(short, long, default_value = "saved")]
        status: String,

        /// Minimum salary, in dollars
        #[arg(long)]
        salary_min: Option<u64>,

        /// Maximum salary, in dollars
        #[arg(long)]
        salary_max: Option<u64>,
    },

    /// Change fields of an application
    Update {
        /// Application ID
        id: String,

        #[arg(long)]
        company: Option<String>,

        #[arg(long)]
        position: Option<String>,

        #[arg(long)]
        location: Option<String>,

        #[arg(long)]
        salary_min: Option<u64>,

        #[arg(long)]
        salary_max: Option<u64>,

        #[arg(long)]
        next_action: Option<String>,
    },

    /// Move an application to a new pipeline status
    Status {
        /// Application ID
        id: String,

        /// New status
        status: String,
    },

    /// Delete an application
    Delete {
        /// Application ID
        id: String,
    },

    /// Manage next steps
    Step {
        #[command(subcommand)]
        command: StepCommands,
    },

    /// Manage interview events
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },

    /// Manage contacts
    Contact {
        #[command(subcommand)]
        command: ContactCommands,
    },

    /// Manage notes
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },

    /// Follow an application and print every change until Ctrl-C
    Watch {
        /// Application ID
        id: String,

        /// Seconds between refreshes
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum StepCommands {
    /// Add a next step to an application
    Add {
        /// Application ID
        id: String,

        title: String,

        /// Due date (YYYY-MM-DD)
        due: String,
    },

    /// Mark a step as done
    Done {
        /// Application ID
        app_id: String,

        /// Step ID
        step_id: String,

        /// Mark as not done instead
        #[arg(long)]
        undo: bool,
    },
}

#[derive(Subcommand)]
enum EventCommands {
    /// Record an interview or other event
    Add {
        /// Application ID
        id: String,

        title: String,

        /// Event date (YYYY-MM-DD or RFC 3339)
        date: String,

        #[arg(short, long, default_value = "")]
        description: String,
    },
}

#[derive(Subcommand)]
enum ContactCommands {
    /// Add a contact to an application
    Add {
        /// Application ID
        id: String,

        name: String,

        #[arg(short, long)]
        role: Option<String>,

        #[arg(short, long)]
        email: Option<String>,

        #[arg(short, long)]
        phone: Option<String>,
    },
}

#[derive(Subcommand)]
enum NoteCommands {
    /// Attach a note to an application
    Add {
        /// Application ID
        id: String,

        content: String,
    },
}

/// Prints mutation outcomes the way the rest of the CLI prints results.
struct ConsoleSink;

impl NotificationSink for ConsoleSink {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Success { message, .. } => println!("{}.", message),
            Notification::Failure { .. } => eprintln!("{}", notification.summary()),
        }
    }
}

struct App {
    queries: QueryCoordinator,
    mutations: MutationCoordinator,
}

impl App {
    fn new(config: &ClientConfig) -> Result<Self> {
        let api = Arc::new(ApiClient::new(config)?);
        let store = CacheStore::new();
        Ok(Self {
            queries: QueryCoordinator::new(store.clone(), api.clone(), config.retry),
            mutations: MutationCoordinator::new(store, api, Arc::new(ConsoleSink)),
        })
    }

    async fn load_application(&self, id: &str) -> Result<CompleteApplication> {
        let value = self
            .queries
            .fetch(&QueryKey::application(id))
            .await
            .with_context(|| format!("Failed to load application {}", id))?;
        match value {
            CacheValue::Application(detail) => Ok(*detail),
            CacheValue::Applications(_) => anyhow::bail!("Unexpected listing for application {}", id),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = &cli.api_url {
        config = config.with_base_url(url)?;
    }
    if let Some(secs) = cli.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    tracing::debug!(base_url = %config.base_url, "using applications API");

    let app = App::new(&config)?;

    // Mutation failures are already reported by the sink; only the exit code
    // is left to set.
    let ok = match cli.command {
        Commands::List { status } => {
            let status = status.map(|s| s.parse::<ApplicationStatus>()).transpose()?;
            let value = app
                .queries
                .fetch(&QueryKey::Applications)
                .await
                .context("Failed to load applications")?;
            let apps: Vec<_> = value
                .as_applications()
                .unwrap_or_default()
                .iter()
                .filter(|a| status.is_none_or(|s| a.status == s))
                .collect();
            if apps.is_empty() {
                println!("No applications found.");
            } else {
                println!(
                    "{:<10} {:<13} {:<22} {:<26} {:>12} {:<12}",
                    "ID", "STATUS", "COMPANY", "POSITION", "SALARY", "UPDATED"
                );
                println!("{}", "-".repeat(100));
                for a in apps {
                    println!(
                        "{:<10} {:<13} {:<22} {:<26} {:>12} {:<12}",
                        truncate(&a.id, 10),
                        a.status,
                        truncate(&a.company, 20),
                        truncate(&a.position, 24),
                        salary_range(a.salary_min, a.salary_max),
                        relative_date(&a.last_updated)
                    );
                }
            }
            true
        }

        Commands::Show { id } => {
            let detail = app.load_application(&id).await?;
            print_application(&detail);
            true
        }

        Commands::Add {
            company,
            position,
            location,
            status,
            salary_min,
            salary_max,
        } => {
            let data = NewApplication {
                company,
                position,
                location,
                status: status.parse()?,
                salary_min,
                salary_max,
            };
            match app.mutations.create_application(&data).await {
                Ok(created) => {
                    println!("Added application {} ({} at {})", created.id, created.position, created.company);
                    true
                }
                Err(_) => false,
            }
        }

        Commands::Update {
            id,
            company,
            position,
            location,
            salary_min,
            salary_max,
            next_action,
        } => {
            let patch = ApplicationPatch {
                company,
                position,
                location,
                status: None,
                salary_min,
                salary_max,
                next_action,
            };
            app.mutations.update_application(&id, &patch).await.is_ok()
        }

        Commands::Status { id, status } => {
            let status: ApplicationStatus = status.parse()?;
            match app.mutations.update_status(&id, status).await {
                Ok(updated) => {
                    println!("{} at {} is now {}", updated.position, updated.company, updated.status);
                    true
                }
                Err(_) => false,
            }
        }

        Commands::Delete { id } => app.mutations.delete_application(&id).await.is_ok(),

        Commands::Step { command } => match command {
            StepCommands::Add { id, title, due } => {
                let data = NewStep {
                    title,
                    due_date: due,
                    completed: false,
                };
                match app.mutations.create_step(&id, &data).await {
                    Ok(step) => {
                        println!("Step {}: {} (due {})", step.id, step.title, relative_date(&step.due_date));
                        true
                    }
                    Err(_) => false,
                }
            }
            StepCommands::Done { app_id, step_id, undo } => app
                .mutations
                .set_step_completed(&app_id, &step_id, !undo)
                .await
                .is_ok(),
        },

        Commands::Event { command } => match command {
            EventCommands::Add {
                id,
                title,
                date,
                description,
            } => {
                let data = NewEvent {
                    title,
                    description,
                    event_date: date,
                };
                app.mutations.create_event(&id, &data).await.is_ok()
            }
        },

        Commands::Contact { command } => match command {
            ContactCommands::Add {
                id,
                name,
                role,
                email,
                phone,
            } => {
                let data = NewContact {
                    name,
                    role,
                    email,
                    phone,
                };
                app.mutations.create_contact(&id, &data).await.is_ok()
            }
        },

        Commands::Note { command } => match command {
            NoteCommands::Add { id, content } => app.mutations.create_note(&id, &NewNote { content }).await.is_ok(),
        },

        Commands::Watch { id, interval } => {
            watch_application(&app, &id, Duration::from_secs(interval.max(1))).await?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn watch_application(app: &App, id: &str, every: Duration) -> Result<()> {
    let key = QueryKey::application(id);
    let mut handle = app.queries.watch(&key);
    print_state(&handle.state());

    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            state = handle.changed() => print_state(&state),
            _ = ticker.tick() => {
                // Observers refetch on invalidation.
                app.queries.store().invalidate(&key);
            }
            _ = &mut ctrl_c => break,
        }
    }
    Ok(())
}

fn print_state(state: &QueryState) {
    let now = Local::now().format("%H:%M:%S");
    match state.status {
        QueryStatus::Idle => println!("[{}] idle", now),
        QueryStatus::Loading => println!("[{}] loading...", now),
        QueryStatus::Success => {
            if let Some(detail) = state.application() {
                let a = &detail.application;
                let open = detail.next_steps.iter().filter(|s| !s.completed).count();
                println!(
                    "[{}] {} - {} ({}), {} open step(s){}",
                    now,
                    a.company,
                    a.position,
                    a.status,
                    open,
                    if state.is_fetching { ", refreshing" } else { "" }
                );
            }
        }
        QueryStatus::Error => {
            let message = state.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
            println!("[{}] error after {} attempt(s): {}", now, state.failure_count, message);
        }
    }
}

fn print_application(detail: &CompleteApplication) {
    let a = &detail.application;
    println!("Application {}", a.id);
    println!("Company: {}", a.company);
    println!("Position: {}", a.position);
    println!("Location: {}", a.location);
    println!("Status: {}", a.status);
    if a.salary_min.is_some() || a.salary_max.is_some() {
        println!("Salary: {}", salary_range(a.salary_min, a.salary_max));
    }
    if !a.next_action.is_empty() {
        println!("Next action: {}", a.next_action);
    }
    if !a.created_at.is_empty() {
        println!("Created: {}", relative_date(&a.created_at));
    }
    if !a.last_updated.is_empty() {
        println!("Updated: {}", relative_date(&a.last_updated));
    }

    if !detail.next_steps.is_empty() {
        println!("\nNext steps ({}):", detail.next_steps.len());
        for step in &detail.next_steps {
            println!(
                "  [{}] {} - {} (due {})",
                if step.completed { "x" } else { " " },
                step.id,
                step.title,
                relative_date(&step.due_date)
            );
        }
    }

    if !detail.events.is_empty() {
        println!("\nEvents ({}):", detail.events.len());
        for event in &detail.events {
            println!("  {} - {} ({})", event.id, event.title, relative_date(&event.event_date));
            if !event.description.is_empty() {
                println!("{}", indented(&event.description, "      "));
            }
        }
    }

    if !detail.contacts.is_empty() {
        println!("\nContacts ({}):", detail.contacts.len());
        for contact in &detail.contacts {
            let extra: Vec<&str> = [&contact.role, &contact.email, &contact.phone]
                .into_iter()
                .filter_map(|field| field.as_deref())
                .collect();
            if extra.is_empty() {
                println!("  {}", contact.name);
            } else {
                println!("  {} ({})", contact.name, extra.join(", "));
            }
        }
    }

    if !detail.notes.is_empty() {
        println!("\nNotes ({}):", detail.notes.len());
        for note in &detail.notes {
            println!("  {}:", relative_date(&note.created_at));
            println!("{}", indented(&note.content, "    "));
        }
    }
}

fn indented(text: &str, prefix: &str) -> String {
    let options = textwrap::Options::new(76)
        .initial_indent(prefix)
        .subsequent_indent(prefix);
    textwrap::fill(text, options)
}

fn salary_range(min: Option<u64>, max: Option<u64>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("${}k-${}k", min / 1000, max / 1000),
        (Some(min), None) => format!("${}k+", min / 1000),
        (None, Some(max)) => format!("<${}k", max / 1000),
        (None, None) => "-".to_string(),
    }
}

/// "today", "3 days ago", "in 2 days". Unparseable input is shown as-is.
fn relative_date(raw: &str) -> String {
    let date = match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&Local).date_naive(),
        Err(_) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) if raw.is_empty() => return "-".to_string(),
            Err(_) => return raw.to_string(),
        },
    };
    let days = (date - Local::now().date_naive()).num_days();
    match days {
        0 => "today".to_string(),
        1 => "tomorrow".to_string(),
        -1 => "yesterday".to_string(),
        d if d > 0 => format!("in {} days", d),
        d => format!("{} days ago", -d),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
