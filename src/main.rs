use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use pharmatrail_core::{
    batch::{self, BatchStatus},
    config::{LoggingConfig, TrailConfig},
    error::{ErrorCode, LedgerError},
    ledger::{self, CreateBatch, TransferKind, TransferRequest},
    medicine::{self, NewMedicine},
    party::{self, NewParty, Role},
    report::{self, NewReport, ReportStatus},
    store::Store,
    util,
    verify::{self, VerifyRequest},
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "pharmatrail",
    version = util::VERSION,
    about = "Custody ledger and verification engine for pharmaceutical batches"
)]
struct Cli {
    /// Path to the ledger database (SQLite).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty store database.
    InitStore,

    /// Register a party and print its id.
    RegisterParty {
        #[arg(long)]
        name: String,
        /// admin, manufacturer, distributor, retailer or consumer.
        #[arg(long)]
        role: Role,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        license_no: Option<String>,
        #[arg(long)]
        contact: Option<String>,
    },

    /// Add a medicine to the acting manufacturer's catalog.
    AddMedicine {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        drug_code: String,
        #[arg(long)]
        composition: String,
        #[arg(long)]
        dosage: String,
        #[arg(long)]
        shelf_life_months: u32,
    },

    /// Create a batch with a fresh verification code and print the code.
    CreateBatch {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        medicine: Uuid,
        #[arg(long)]
        batch_number: String,
        /// YYYY-MM-DD.
        #[arg(long)]
        manufacture_date: String,
        /// YYYY-MM-DD.
        #[arg(long)]
        expiry_date: String,
        #[arg(long)]
        quantity: u32,
    },

    /// Print the canonical label payload for a batch (by id or code).
    PrintLabel {
        #[arg(long)]
        batch: Option<Uuid>,
        #[arg(long)]
        code: Option<String>,
    },

    /// Ship part or all of a batch to another party.
    Transfer {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        to: Uuid,
        #[arg(long)]
        quantity: u32,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Record a retail sale; the batch goes sold when it empties.
    RecordSale {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        quantity: u32,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Mark a batch expired or recalled.
    MarkStatus {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        batch: Uuid,
        /// expired or recalled.
        #[arg(long)]
        status: BatchStatus,
    },

    /// Resolve a scanned code and print the verification result.
    Verify {
        /// A bare code or a scanned label payload.
        #[arg(long)]
        scanned: String,
        #[arg(long)]
        verifier: Option<Uuid>,
        #[arg(long)]
        location: Option<String>,
    },

    /// File a counterfeit / suspicious-product report.
    SubmitReport {
        #[arg(long)]
        scanned: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        reporter: Option<Uuid>,
    },

    /// Admin triage of a report.
    UpdateReport {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        report: Uuid,
        /// pending, investigating, resolved or rejected.
        #[arg(long)]
        status: ReportStatus,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Print the custody trail of a batch (by id or code).
    History {
        #[arg(long)]
        batch: Option<Uuid>,
        #[arg(long)]
        code: Option<String>,
    },

    /// List batches, optionally narrowed to a holder and/or status.
    Inventory {
        #[arg(long)]
        owner: Option<Uuid>,
        #[arg(long)]
        status: Option<BatchStatus>,
    },

    /// Re-verify the whole transfer chain and per-batch conservation.
    Audit,

    /// Print version information.
    Version,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut cfg = TrailConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env();

    init_logging(&cfg.logging);

    let db_path = cli.db.unwrap_or(cfg.paths.db.clone());
    util::validate_path(&db_path, "db")?;

    match cli.cmd {
        Commands::InitStore => {
            let store = Store::create_new(&db_path, cfg.store.busy_timeout_ms)
                .context("create store")?;
            info!(store_id = %store.meta().store_id, db = %db_path.display(), "store initialized");
        }

        Commands::RegisterParty {
            name,
            role,
            company,
            license_no,
            contact,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let party = party::register_party(
                &mut store,
                NewParty {
                    name,
                    role,
                    company,
                    license_no,
                    contact,
                },
            )
            .context("register party")?;
            println!("{}", party.id);
        }

        Commands::AddMedicine {
            actor,
            name,
            drug_code,
            composition,
            dosage,
            shelf_life_months,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let actor = party::resolve_actor(&store, actor).context("resolve actor")?;
            let medicine = medicine::add_medicine(
                &mut store,
                actor,
                NewMedicine {
                    name,
                    drug_code,
                    composition,
                    dosage,
                    shelf_life_months,
                },
            )
            .context("add medicine")?;
            println!("{}", medicine.id);
        }

        Commands::CreateBatch {
            actor,
            medicine,
            batch_number,
            manufacture_date,
            expiry_date,
            quantity,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let actor = party::resolve_actor(&store, actor).context("resolve actor")?;
            let batch = ledger::create_batch(
                &mut store,
                actor,
                CreateBatch {
                    medicine_id: medicine,
                    batch_number,
                    manufacture_date,
                    expiry_date,
                    quantity,
                },
            )
            .context("create batch")?;
            println!("{}", batch.code);
        }

        Commands::PrintLabel { batch, code } => {
            let store = open_store(&db_path, &cfg)?;
            let batch = lookup_batch(&store, batch, code)?;
            let medicine =
                medicine::get_medicine(&store, batch.medicine_id).context("load medicine")?;
            let label = batch::label_payload(&batch, &medicine);
            println!(
                "{}",
                serde_json::to_string_pretty(&label).context("serialize label")?
            );
        }

        Commands::Transfer {
            actor,
            batch,
            to,
            quantity,
            notes,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let actor = party::resolve_actor(&store, actor).context("resolve actor")?;
            let (transfer, updated) = ledger::transfer(
                &mut store,
                actor,
                TransferRequest {
                    batch_id: batch,
                    to_party_id: to,
                    quantity,
                    kind: TransferKind::Shipment,
                    notes,
                },
            )
            .context("transfer")?;
            info!(
                seq = transfer.seq,
                remaining = updated.current_quantity,
                status = %updated.status,
                "transfer appended"
            );
        }

        Commands::RecordSale {
            actor,
            batch,
            quantity,
            notes,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let actor = party::resolve_actor(&store, actor).context("resolve actor")?;
            let (transfer, updated) =
                ledger::record_sale(&mut store, actor, batch, quantity, notes)
                    .context("record sale")?;
            info!(
                seq = transfer.seq,
                remaining = updated.current_quantity,
                status = %updated.status,
                "sale appended"
            );
        }

        Commands::MarkStatus {
            actor,
            batch,
            status,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let actor = party::resolve_actor(&store, actor).context("resolve actor")?;
            let updated = ledger::mark_expired_or_recalled(&mut store, actor, batch, status)
                .context("mark status")?;
            info!(batch_id = %updated.id, status = %updated.status, "batch marked");
        }

        Commands::Verify {
            scanned,
            verifier,
            location,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let verification = verify::verify(
                &mut store,
                VerifyRequest {
                    scanned,
                    verifier_party_id: verifier,
                    location,
                },
            )
            .context("verify")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&verification).context("serialize verification")?
            );
        }

        Commands::SubmitReport {
            scanned,
            category,
            description,
            location,
            reporter,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let filed = report::submit_report(
                &mut store,
                NewReport {
                    scanned,
                    category,
                    description,
                    location,
                    reporter_party_id: reporter,
                },
            )
            .context("submit report")?;
            println!("{}", filed.id);
        }

        Commands::UpdateReport {
            actor,
            report,
            status,
            notes,
        } => {
            let mut store = open_store(&db_path, &cfg)?;
            let actor = party::resolve_actor(&store, actor).context("resolve actor")?;
            let updated = report::update_report(&mut store, actor, report, status, notes)
                .context("update report")?;
            info!(report_id = %updated.id, status = %updated.status, "report updated");
        }

        Commands::History { batch, code } => {
            let store = open_store(&db_path, &cfg)?;
            let batch = lookup_batch(&store, batch, code)?;
            let trail = ledger::batch_history(&store, batch.id).context("load history")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&trail).context("serialize history")?
            );
        }

        Commands::Inventory { owner, status } => {
            let store = open_store(&db_path, &cfg)?;
            let batches = ledger::list_batches(&store, owner, status).context("list batches")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&batches).context("serialize inventory")?
            );
        }

        Commands::Audit => {
            let mut store = open_store(&db_path, &cfg)?;
            let audit = ledger::audit(&mut store).context("audit")?;
            info!(
                transfers = audit.transfers_checked,
                batches = audit.batches_checked,
                "audit passed"
            );
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_store(db_path: &Path, cfg: &TrailConfig) -> Result<Store> {
    Store::open_existing(db_path, cfg.store.busy_timeout_ms).context("open store")
}

fn lookup_batch(
    store: &Store,
    batch: Option<Uuid>,
    code: Option<String>,
) -> Result<batch::Batch> {
    match (batch, code) {
        (Some(id), None) => ledger::get_batch(store, id).context("load batch"),
        (None, Some(code)) => ledger::get_batch_by_code(store, &code).context("load batch"),
        _ => anyhow::bail!("pass exactly one of --batch or --code"),
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<LedgerError>() {
        Some(e) => ErrorCode::from(e) as i32,
        None => 1,
    }
}

fn init_logging(cfg: &LoggingConfig) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        // JSON output to stdout for container / SIEM pipelines.
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        // JSON-lines output to file for SIEM integration.
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .expect("failed to open json log file");
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer();
        registry.with(file_layer).with(console_layer).init();
    } else {
        // Default: human-readable output to stderr.
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).init();
    }
}
