// Interactive classroom chat client

use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use classroom_chat::classroom::{ClassEvent, MessageKind};
use classroom_chat::config::Config;
use classroom_chat::pages::{PageSettings, StudentPage, TeacherPage};
use classroom_chat::{ClassService, HttpNotifier, MemoryBroker, RealtimeTransport, ServiceOptions, Transport};

#[derive(Parser)]
#[command(name = "classroom-chat")]
#[command(about = "Classroom live chat client", long_about = None)]
struct Cli {
    /// Class to join (default: DEFAULT_CLASS_ID)
    #[arg(short, long)]
    class: Option<String>,

    /// Use an in-process broker instead of the realtime provider
    #[arg(long)]
    local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join as the teacher
    Teacher {
        /// Display name
        #[arg(short, long, default_value = "Teacher")]
        name: String,
    },

    /// Join as a student
    Student {
        /// Display name
        #[arg(short, long)]
        name: String,
    },

    /// Validate configuration and exit
    CheckConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_tracing();

    if let Err(e) = run(cli, config).await {
        eprintln!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: Config) -> Result<(), Box<dyn Error>> {
    if let Commands::CheckConfig = cli.command {
        check_config(&config);
        return Ok(());
    }

    config.log_summary();

    let transport: Arc<dyn Transport> = if cli.local {
        println!("{}", "Using in-process broker".yellow());
        Arc::new(MemoryBroker::new().transport())
    } else {
        Arc::new(RealtimeTransport::new(config.realtime.clone())?)
    };
    let notifier = Arc::new(HttpNotifier::new(&config.api)?);
    let service = ClassService::new(transport, notifier, ServiceOptions::from_config(&config.realtime));
    service.on_event(print_event);

    let mut settings = PageSettings::from_config(&config.app);
    if let Some(class_id) = cli.class {
        settings.class_id = class_id;
    }

    let result = match cli.command {
        Commands::Teacher { name } => teacher_session(service.clone(), &name, settings).await,
        Commands::Student { name } => student_session(service.clone(), &name, settings).await,
        Commands::CheckConfig => Ok(()),
    };

    service.dispose();
    result
}

fn check_config(config: &Config) {
    println!("{}", "Checking configuration...".cyan());
    println!("  API base URL:   {}", config.api.base_url);
    println!("  Realtime host:  {}", config.realtime.realtime_host);
    println!("  API key:        {}", config.realtime.masked_key());
    println!("  Channel prefix: {}", config.realtime.channel_prefix);
    println!("  Class:          {}", config.app.default_class_id);

    let errors = config.validate();
    if errors.is_empty() {
        println!("{} Configuration is valid", "✓".green());
    } else {
        for error in errors {
            println!("{} {}", "✗".red(), error);
        }
    }
}

fn print_event(event: &ClassEvent) {
    match event {
        ClassEvent::Message(msg) => match msg.kind {
            MessageKind::System => println!("{} {}", "[system]".yellow(), msg.message.yellow()),
            MessageKind::HandRaise => println!("{} {}", msg.from_name.magenta().bold(), msg.message),
            MessageKind::PrivateChat => println!(
                "{} {}: {}",
                "[private]".blue(),
                msg.from_name.blue().bold(),
                msg.message
            ),
            MessageKind::Chat => println!("{}: {}", msg.from_name.cyan().bold(), msg.message),
        },
        ClassEvent::MemberJoined { notice, .. } => println!("{} {}", "→".green(), notice.message.green()),
        ClassEvent::MemberLeft { notice, .. } => println!("{} {}", "←".red(), notice.message.dimmed()),
        ClassEvent::CursorToggled { teacher_name, enabled, .. } => println!(
            "{}",
            format!(
                "{} turned cursor sharing {}",
                teacher_name,
                if *enabled { "on" } else { "off" }
            )
            .dimmed()
        ),
        ClassEvent::PrivateChatRequested { teacher_name, .. } => println!(
            "{} {} wants to chat privately. Type {} or {}",
            "★".yellow(),
            teacher_name.bold(),
            "/accept".cyan(),
            "/decline".cyan()
        ),
        ClassEvent::PrivateChatEnded { by_name, .. } => {
            println!("{}", format!("Private chat ended by {}", by_name).dimmed())
        }
        ClassEvent::ConnectionLost { reason } => {
            println!("{} {}", "Connection lost, reconnecting:".yellow(), reason.dimmed())
        }
        ClassEvent::ConnectionRestored => println!("{}", "Reconnected".green()),
        ClassEvent::ConnectionFailed { reason } => println!(
            "{} {} Type {} to retry",
            "Connection failed:".red(),
            reason,
            "/reconnect".cyan()
        ),
        ClassEvent::CursorMoved(_) | ClassEvent::CursorCleared { .. } => {}
    }
}

fn report<T>(result: classroom_chat::Result<T>) {
    if let Err(e) = result {
        println!("{} {}", "✗".red(), e);
    }
}

/// Reads stdin lines until EOF or Ctrl+C
async fn next_line(lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>) -> Option<String> {
    tokio::select! {
        line = lines.next_line() => line.ok().flatten(),
        _ = tokio::signal::ctrl_c() => None,
    }
}

async fn teacher_session(service: ClassService, name: &str, settings: PageSettings) -> Result<(), Box<dyn Error>> {
    let page = TeacherPage::new(service.clone(), name, settings);
    page.join_class().await?;

    println!(
        "{} Joined {} as {} ({})",
        "✓".green(),
        page.class_id().bold(),
        page.teacher().name.bold(),
        page.teacher().id.dimmed()
    );
    print_teacher_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = next_line(&mut lines).await {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match command {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => print_teacher_help(),
            "/announce" => report(page.send_announcement(rest).await),
            "/cursor" => match page.toggle_cursor_streaming().await {
                Ok(enabled) => println!("Cursor streaming {}", if enabled { "on" } else { "off" }),
                Err(e) => println!("{} {}", "✗".red(), e),
            },
            "/move" => {
                let coords: Vec<f64> = rest.split_whitespace().filter_map(|v| v.parse().ok()).collect();
                match coords.as_slice() {
                    [x, y] => {
                        page.move_cursor(*x, *y);
                    }
                    _ => println!("{}", "Usage: /move <x> <y>".yellow()),
                }
            }
            "/roster" => {
                let view = page.snapshot();
                if view.roster.is_empty() {
                    println!("{}", "No students yet".dimmed());
                }
                for (id, name) in view.roster {
                    println!("  {} {}", name.bold(), id.dimmed());
                }
            }
            "/private" => {
                let view = page.snapshot();
                let student_id = view
                    .roster
                    .iter()
                    .find(|(id, name)| *id == rest || name.eq_ignore_ascii_case(rest))
                    .map(|(id, _)| id.clone())
                    .unwrap_or_else(|| rest.to_string());
                if student_id.is_empty() {
                    println!("{}", "Usage: /private <student name or id>".yellow());
                } else {
                    report(page.start_private_chat(&student_id).await);
                }
            }
            "/end" => report(page.end_private_chat().await),
            "/reconnect" => report(service.reconnect().await),
            _ => {
                if page.snapshot().private_chat.is_some() {
                    page.set_private_draft(line);
                    report(page.send_private_message().await);
                } else {
                    page.set_draft(line);
                    report(page.send_message().await);
                }
            }
        }
    }

    page.leave_class().await?;
    println!("Goodbye!");
    Ok(())
}

async fn student_session(service: ClassService, name: &str, settings: PageSettings) -> Result<(), Box<dyn Error>> {
    let page = StudentPage::new(service.clone(), settings);
    page.join_class(name).await?;

    if let Some(student) = page.student() {
        println!(
            "{} Joined {} as {} ({})",
            "✓".green(),
            page.class_id().bold(),
            student.name.bold(),
            student.id.dimmed()
        );
    }
    print_student_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = next_line(&mut lines).await {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => print_student_help(),
            "/hand" => report(page.raise_hand().await),
            "/accept" => report(page.accept_private_chat().await),
            "/decline" => {
                if !page.decline_private_chat() {
                    println!("{}", "No pending invite".dimmed());
                }
            }
            "/end" => report(page.end_private_chat().await),
            "/reconnect" => report(service.reconnect().await),
            _ => {
                if page.snapshot().private_chat.is_some() {
                    page.set_private_draft(line);
                    report(page.send_private_message().await);
                } else {
                    page.set_draft(line);
                    report(page.send_message().await);
                }
            }
        }
    }

    page.leave_class().await?;
    println!("Goodbye!");
    Ok(())
}

fn print_teacher_help() {
    println!("\n{}", "Teacher Commands".bold());
    println!("{}", "─".repeat(60));
    println!("  {:<22} send to the class (or the open private chat)", "<text>".cyan());
    println!("  {:<22} system announcement via the backend", "/announce <text>".cyan());
    println!("  {:<22} toggle cursor streaming", "/cursor".cyan());
    println!("  {:<22} move the shared cursor", "/move <x> <y>".cyan());
    println!("  {:<22} list connected students", "/roster".cyan());
    println!("  {:<22} open a private chat", "/private <student>".cyan());
    println!("  {:<22} end the private chat", "/end".cyan());
    println!("  {:<22} drop and re-establish the connection", "/reconnect".cyan());
    println!("  {:<22} leave the class", "/quit".cyan());
    println!();
}

fn print_student_help() {
    println!("\n{}", "Student Commands".bold());
    println!("{}", "─".repeat(60));
    println!("  {:<22} send to the class (or the open private chat)", "<text>".cyan());
    println!("  {:<22} raise your hand", "/hand".cyan());
    println!("  {:<22} accept the teacher's private chat", "/accept".cyan());
    println!("  {:<22} decline it", "/decline".cyan());
    println!("  {:<22} end the private chat", "/end".cyan());
    println!("  {:<22} drop and re-establish the connection", "/reconnect".cyan());
    println!("  {:<22} leave the class", "/quit".cyan());
    println!();
}
