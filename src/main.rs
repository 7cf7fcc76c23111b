use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand, ValueEnum};

use inbox_triage::clock::{Clock, SystemClock};
use inbox_triage::config::{self, ResolverConfig, TriageConfig};
use inbox_triage::llm::{LlmConfig, create_provider};
use inbox_triage::mail::{ImapConfig, ImapMailTransport, MailTransport};
use inbox_triage::resolver::CorrespondenceResolver;
use inbox_triage::store::{Database, LibSqlBackend};
use inbox_triage::triage::orchestrator::record_feedback;
use inbox_triage::triage::{
    ContextEnricher, Feedback, LlmCompanyResearcher, LlmDecisionService, TriageOrchestrator,
    TriageRun,
};

#[derive(Debug, Parser)]
#[command(
    name = "inbox-triage",
    version,
    about = "Triage recent email and keep CRM correspondence dates current",
    after_help = "Examples:\n  inbox-triage triage --limit 20\n  inbox-triage feedback INBOX:4812 bad --text \"not spam\"\n  inbox-triage resolve"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Fetch and triage the most recent inbox messages")]
    Triage {
        #[arg(long, default_value_t = 10, help = "How many recent messages to triage")]
        limit: usize,
        #[arg(long, help = "Emit the full runs as JSON")]
        json: bool,
    },
    #[command(about = "Backfill last_chat for contacts and companies from mail history")]
    Resolve,
    #[command(about = "Rate a stored triage decision")]
    Feedback {
        email_id: String,
        rating: Rating,
        #[arg(long, help = "What was wrong (bad ratings)")]
        text: Option<String>,
    },
    #[command(about = "Print the stored decision for an email as JSON")]
    Show { email_id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Rating {
    Good,
    Bad,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let db_path = config::database_path();
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&db_path))
            .await
            .with_context(|| format!("Failed to open database at {db_path}"))?,
    );

    match cli.command {
        Command::Triage { limit, json } => {
            let triage_config = TriageConfig::from_env()?;
            let resolver_config = ResolverConfig::from_env()?;
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let mail = mail_transport(&triage_config, clock.clone())?;
            let llm = create_provider(&LlmConfig::from_env()?)?;
            let pacer = config::pacer(&triage_config, &resolver_config);

            let enricher = ContextEnricher::new(&triage_config, db.clone(), mail.clone(), clock.clone())
                .with_researcher(Arc::new(LlmCompanyResearcher::new(llm.clone())));
            let orchestrator = TriageOrchestrator::new(
                enricher,
                Arc::new(LlmDecisionService::new(llm)),
                db,
                mail,
                pacer,
                clock,
            );

            let runs = orchestrator.triage_recent(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                for run in &runs {
                    println!("{}", summarize(run));
                }
            }
        }
        Command::Resolve => {
            let triage_config = TriageConfig::from_env()?;
            let resolver_config = ResolverConfig::from_env()?;
            let mail = mail_transport(&triage_config, Arc::new(SystemClock))?;
            let pacer = config::pacer(&triage_config, &resolver_config);

            let report = CorrespondenceResolver::new(resolver_config, db, mail, pacer)
                .run()
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Feedback {
            email_id,
            rating,
            text,
        } => {
            let feedback = match rating {
                Rating::Good => Feedback::Good,
                Rating::Bad => Feedback::Bad {
                    text: text.unwrap_or_default(),
                },
            };
            record_feedback(db.as_ref(), &email_id, feedback, SystemClock.now()).await?;
            println!("Feedback recorded for {email_id}");
        }
        Command::Show { email_id } => {
            let decision = db
                .get_decision(&email_id)
                .await?
                .ok_or_else(|| anyhow!("No decision stored for {email_id}"))?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
    }

    Ok(())
}

fn mail_transport(
    triage_config: &TriageConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn MailTransport>> {
    let imap = ImapConfig::from_env(triage_config.timezone)
        .ok_or_else(|| anyhow!("EMAIL_IMAP_HOST not set; mail access is required"))?;
    Ok(Arc::new(ImapMailTransport::new(imap).with_clock(clock)))
}

fn summarize(run: &TriageRun) -> String {
    match &run.decision {
        Some(d) => format!(
            "{}\t{}\t{} ({}/10)\tarchived={} drafted={}",
            run.email_id, run.state, d.key_point, d.confidence, d.auto_archived, d.draft_created
        ),
        None => {
            let reason = run
                .failures()
                .last()
                .map(|e| format!("{e:?}"))
                .unwrap_or_default();
            format!("{}\t{}\t{}", run.email_id, run.state, reason)
        }
    }
}
