use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use kia_core::journal::YamlJournal;
use kia_core::repositories::antenatal::NewVisit;
use kia_core::repositories::delivery::NewDelivery;
use kia_core::repositories::immunization::{NewDose, TargetFilter};
use kia_core::repositories::pregnancy::{NewPregnancy, RiskAssessment};
use kia_core::residents::NewResident;
use kia_core::{
    CoreConfig, EventSink, FanOut, KiaEngine, KiaError, LocalResidentDirectory, MemoryEventLog,
    Nik, NonEmptyText, PageRequest, Period, RequestContext, ShardableUuid, TenantId,
    TracingEventSink, WorkerRef,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "kia")]
#[command(about = "KIA maternal and child health register CLI")]
struct Cli {
    /// Journal directory
    #[arg(long, global = true, env = "KIA_DATA_DIR", default_value = "kia_data")]
    data_dir: PathBuf,
    /// Posyandu (tenant) identifier
    #[arg(long, global = true, env = "KIA_TENANT", default_value = "default")]
    tenant: String,
    /// Worker (kader) identifier recorded on every write
    #[arg(long, global = true, env = "KIA_WORKER", default_value = "cli")]
    worker: String,
    /// Worker display name; defaults to the worker identifier
    #[arg(long, global = true)]
    worker_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an existing resident with the local directory
    RegisterResident {
        /// 16-digit NIK
        nik: String,
        name: String,
        /// Date of birth (YYYY-MM-DD)
        birth_date: String,
        /// M/F (or L/P)
        sex: String,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        sub_village: Option<String>,
    },
    /// Open a pregnancy for the mother with this NIK
    OpenPregnancy {
        mother_nik: String,
        /// First day of last menstrual period (YYYY-MM-DD)
        lmp_date: String,
        #[arg(long)]
        gravida: u32,
        #[arg(long)]
        parity: u32,
        #[arg(long, default_value_t = 0)]
        prior_abortions: u32,
        /// low, high or very-high
        #[arg(long, default_value = "low")]
        risk: String,
        /// Repeatable
        #[arg(long = "risk-factor")]
        risk_factors: Vec<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reassess the risk of an open pregnancy
    UpdateRisk {
        pregnancy_id: String,
        risk: String,
        #[arg(long = "risk-factor")]
        risk_factors: Vec<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Record an antenatal visit
    AddVisit {
        pregnancy_id: String,
        visit_number: i64,
        /// Visit date (YYYY-MM-DD)
        visit_date: String,
        #[arg(long)]
        weight_kg: Option<f64>,
        #[arg(long)]
        bp_sys: Option<u16>,
        #[arg(long)]
        bp_dia: Option<u16>,
        #[arg(long)]
        fundal_height_cm: Option<f64>,
        #[arg(long)]
        fetal_heart_rate: Option<u16>,
        #[arg(long)]
        complaint: Option<String>,
        #[arg(long)]
        action_taken: Option<String>,
        #[arg(long)]
        note: Option<String>,
        /// Id of the visit this one corrects
        #[arg(long)]
        supersedes: Option<String>,
    },
    /// Record a delivery, closing the pregnancy and registering the newborn
    RecordDelivery {
        pregnancy_id: String,
        /// Delivery date (YYYY-MM-DD)
        delivery_date: String,
        #[arg(long)]
        place: String,
        #[arg(long = "type", default_value = "spontaneous")]
        delivery_type: String,
        #[arg(long, default_value = "midwife")]
        attendant_type: String,
        #[arg(long)]
        attendant_name: String,
        #[arg(long, default_value = "good")]
        maternal_condition: String,
        #[arg(long)]
        complication_note: Option<String>,
        #[arg(long, default_value = "healthy-alive")]
        infant_condition: String,
        #[arg(long)]
        weight_g: u32,
        #[arg(long)]
        length_cm: f64,
        /// M/F (or L/P)
        #[arg(long)]
        sex: String,
        #[arg(long)]
        infant_name: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Record an immunization dose for a child
    RecordDose {
        child_id: String,
        /// HB0, BCG, Polio1..4, DPTHBHib1..4, IPV, MR1, MR2
        vaccine_code: String,
        /// Date given (YYYY-MM-DD)
        given_date: String,
        #[arg(long, default_value = "given")]
        status: String,
        #[arg(long)]
        posyandu_site: Option<String>,
        #[arg(long)]
        administration_site: Option<String>,
        #[arg(long)]
        batch: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Show a pregnancy with its visits and delivery
    Pregnancy { pregnancy_id: String },
    /// Show a child's immunization status
    Status { child_id: String },
    /// List the immunization target population
    Targets {
        #[arg(long)]
        min_age_months: Option<u32>,
        #[arg(long)]
        max_age_months: Option<u32>,
        #[arg(long)]
        sub_village: Option<String>,
    },
    /// Immunization coverage for a period (defaults to the current month)
    Coverage {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
}

fn parse_date(value: &str) -> CliResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| format!("expected a YYYY-MM-DD date, got '{}'", value).into())
}

fn join_codes<T: std::fmt::Display>(codes: impl IntoIterator<Item = T>) -> String {
    let joined: Vec<String> = codes.into_iter().map(|c| c.to_string()).collect();
    if joined.is_empty() {
        "-".into()
    } else {
        joined.join(", ")
    }
}

fn open_engine(data_dir: &Path) -> CliResult<KiaEngine> {
    std::fs::create_dir_all(data_dir).map_err(KiaError::DirCreation)?;
    let cfg = Arc::new(CoreConfig::new(
        Some(data_dir.to_path_buf()),
        kia_core::constants::DEFAULT_IDL_COMPLETION_AGE_MONTHS,
        kia_core::constants::DEFAULT_TARGET_MAX_AGE_MONTHS,
    )?);
    let directory = Arc::new(LocalResidentDirectory::open(YamlJournal::new(data_dir))?);
    let feed = MemoryEventLog::open(
        YamlJournal::new(data_dir),
        kia_core::constants::DEFAULT_EVENT_LOG_CAPACITY,
    )?;
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(feed), Arc::new(TracingEventSink)];
    Ok(KiaEngine::open(cfg, directory, Arc::new(FanOut::new(sinks)))?)
}

fn run(cli: Cli, out: &mut impl Write) -> CliResult<()> {
    let Some(command) = cli.command else {
        writeln!(out, "Use 'kia --help' for commands")?;
        return Ok(());
    };

    let worker_name = cli.worker_name.as_deref().unwrap_or(&cli.worker);
    let ctx = RequestContext::new(
        TenantId::parse(&cli.tenant)?,
        WorkerRef::new(&cli.worker, worker_name)?,
    );

    match command {
        Commands::RegisterResident {
            nik,
            name,
            birth_date,
            sex,
            address,
            sub_village,
        } => {
            let directory = LocalResidentDirectory::open(YamlJournal::new(&cli.data_dir))?;
            let resident = directory.register(
                &ctx,
                NewResident {
                    nik: Nik::parse(&nik)?,
                    name: NonEmptyText::new(&name)?,
                    birth_date: parse_date(&birth_date)?,
                    sex: sex.parse()?,
                    address,
                    sub_village,
                },
            )?;
            writeln!(out, "Registered resident {} ({})", resident.name, resident.id)?;
        }
        Commands::OpenPregnancy {
            mother_nik,
            lmp_date,
            gravida,
            parity,
            prior_abortions,
            risk,
            risk_factors,
            note,
        } => {
            let engine = open_engine(&cli.data_dir)?;
            let mother = engine
                .residents()
                .resolve_by_identifier(&ctx, &Nik::parse(&mother_nik)?)?;
            let view = engine.pregnancies().open_pregnancy(
                &ctx,
                NewPregnancy {
                    resident_id: mother.id,
                    lmp_date: parse_date(&lmp_date)?,
                    gravida,
                    parity,
                    prior_abortions,
                    risk_status: risk.parse()?,
                    risk_factors,
                    free_note: note,
                },
            )?;
            writeln!(
                out,
                "Opened pregnancy {} for {}: {} weeks, trimester {}, due {}",
                view.pregnancy.id,
                mother.name,
                view.gestational_age_weeks,
                view.trimester.number(),
                view.estimated_due_date
            )?;
        }
        Commands::UpdateRisk {
            pregnancy_id,
            risk,
            risk_factors,
            note,
        } => {
            let engine = open_engine(&cli.data_dir)?;
            let view = engine.pregnancies().update_risk(
                &ctx,
                &ShardableUuid::parse(&pregnancy_id)?,
                RiskAssessment {
                    risk_status: risk.parse()?,
                    risk_factors,
                    note,
                },
            )?;
            writeln!(
                out,
                "Pregnancy {} risk is now {}",
                view.pregnancy.id, view.pregnancy.risk_status
            )?;
        }
        Commands::AddVisit {
            pregnancy_id,
            visit_number,
            visit_date,
            weight_kg,
            bp_sys,
            bp_dia,
            fundal_height_cm,
            fetal_heart_rate,
            complaint,
            action_taken,
            note,
            supersedes,
        } => {
            let engine = open_engine(&cli.data_dir)?;
            let visit = engine.antenatal().add_visit(
                &ctx,
                &ShardableUuid::parse(&pregnancy_id)?,
                NewVisit {
                    visit_number,
                    visit_date: parse_date(&visit_date)?,
                    weight_kg,
                    blood_pressure_sys: bp_sys,
                    blood_pressure_dia: bp_dia,
                    fundal_height_cm,
                    fetal_heart_rate,
                    complaint,
                    action_taken,
                    note,
                    supersedes: supersedes
                        .as_deref()
                        .map(ShardableUuid::parse)
                        .transpose()?,
                },
            )?;
            writeln!(
                out,
                "Recorded visit {} ({}) on {}",
                visit.visit_number, visit.id, visit.visit_date
            )?;
        }
        Commands::RecordDelivery {
            pregnancy_id,
            delivery_date,
            place,
            delivery_type,
            attendant_type,
            attendant_name,
            maternal_condition,
            complication_note,
            infant_condition,
            weight_g,
            length_cm,
            sex,
            infant_name,
            note,
        } => {
            let engine = open_engine(&cli.data_dir)?;
            let outcome = engine.deliveries().record_delivery(
                &ctx,
                &ShardableUuid::parse(&pregnancy_id)?,
                NewDelivery {
                    delivery_date: parse_date(&delivery_date)?,
                    place,
                    delivery_type: delivery_type.parse()?,
                    attendant_type: attendant_type.parse()?,
                    attendant_name,
                    maternal_condition: maternal_condition.parse()?,
                    maternal_complication_note: complication_note,
                    infant_condition: infant_condition.parse()?,
                    birth_weight_g: weight_g,
                    birth_length_cm: length_cm,
                    infant_sex: sex.parse()?,
                    infant_name,
                    note,
                },
            )?;
            writeln!(
                out,
                "Recorded delivery {}; registered child {} ({})",
                outcome.delivery.id, outcome.child.name, outcome.child.id
            )?;
        }
        Commands::RecordDose {
            child_id,
            vaccine_code,
            given_date,
            status,
            posyandu_site,
            administration_site,
            batch,
            note,
        } => {
            let engine = open_engine(&cli.data_dir)?;
            let record = engine.immunizations().record_dose(
                &ctx,
                &ShardableUuid::parse(&child_id)?,
                NewDose {
                    vaccine: vaccine_code.parse()?,
                    given_date: parse_date(&given_date)?,
                    status: status.parse()?,
                    posyandu_site,
                    administration_site,
                    vaccine_batch: batch,
                    note,
                },
            )?;
            writeln!(
                out,
                "Recorded {} ({:?}) on {}",
                record.vaccine_code, record.status, record.given_date
            )?;
        }
        Commands::Pregnancy { pregnancy_id } => {
            let engine = open_engine(&cli.data_dir)?;
            let id = ShardableUuid::parse(&pregnancy_id)?;
            let view = engine.pregnancies().get(&ctx, &id)?;
            let p = &view.pregnancy;
            writeln!(out, "Pregnancy {} ({:?})", p.id, p.state)?;
            writeln!(
                out,
                "  G{}P{}A{}, LMP {}, due {}",
                p.gravida, p.parity, p.prior_abortions, p.lmp_date, view.estimated_due_date
            )?;
            writeln!(
                out,
                "  {} weeks, trimester {}, risk {}",
                view.gestational_age_weeks,
                view.trimester.number(),
                p.risk_status
            )?;
            for visit in engine.antenatal().list_visits(&ctx, &id)? {
                writeln!(
                    out,
                    "  visit {} on {} by {}",
                    visit.visit_number, visit.visit_date, visit.worker_name
                )?;
            }
            match engine.deliveries().get_delivery(&ctx, &id) {
                Ok(delivery) => writeln!(
                    out,
                    "  delivered {} at {}, {} g, child {}",
                    delivery.delivery_date,
                    delivery.place,
                    delivery.birth_weight_g,
                    delivery.child_resident_id
                )?,
                Err(KiaError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Status { child_id } => {
            let engine = open_engine(&cli.data_dir)?;
            let status = engine
                .immunizations()
                .get_status(&ctx, &ShardableUuid::parse(&child_id)?)?;
            writeln!(
                out,
                "Child {}: {} months, IDL {}",
                status.child_resident_id,
                status.age_months,
                if status.is_complete { "complete" } else { "incomplete" }
            )?;
            writeln!(out, "  given: {}", join_codes(&status.doses_given))?;
            writeln!(out, "  due: {}", join_codes(&status.due))?;
            writeln!(out, "  upcoming: {}", join_codes(&status.upcoming))?;
        }
        Commands::Targets {
            min_age_months,
            max_age_months,
            sub_village,
        } => {
            let engine = open_engine(&cli.data_dir)?;
            let targets = engine.immunizations().list_targets(
                &ctx,
                &TargetFilter {
                    min_age_months,
                    max_age_months,
                    sub_village,
                },
                &PageRequest::all(),
            )?;
            if targets.items.is_empty() {
                writeln!(out, "No children in the target population.")?;
            }
            for entry in targets.items {
                writeln!(
                    out,
                    "{} ({}): {} months, {} doses, {}",
                    entry.child.name,
                    entry.child.id,
                    entry.age_months,
                    entry.doses_given,
                    if entry.is_complete { "IDL" } else { "incomplete" }
                )?;
            }
        }
        Commands::Coverage { from, to } => {
            let engine = open_engine(&cli.data_dir)?;
            let month = Period::month_of(ctx.today());
            let start = from.as_deref().map(parse_date).transpose()?;
            let end = to.as_deref().map(parse_date).transpose()?;
            let period = Period::new(
                start.unwrap_or(month.start()),
                end.unwrap_or(month.end()),
            )?;
            let coverage = engine.statistics().coverage(&ctx, period)?;
            writeln!(
                out,
                "{}..{} (as of {}): {} doses given, IDL {}/{} = {}%",
                period.start(),
                period.end(),
                coverage.as_of,
                coverage.doses_given,
                coverage.idl_count,
                coverage.target_population,
                coverage.idl_percentage
            )?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli, &mut std::io::stdout()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
