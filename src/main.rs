mod archive;
mod batch;
mod config;
mod correlation;
mod dicom;
mod download;
mod error;
mod error_tracker;
mod http;
mod progress;
mod retry;
mod scan;
mod upload;
mod validators;
mod walker;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use archive::{extract_session_archives, ArchiveFormat};
use config::XnatEnvConfig;
use dicom::{run_dicom_send, DicomSenderConfig};
use download::{download_session, DownloadSessionRequest};
use http::Connection;
use progress::default_sinks;
use scan::{run_scan_deletion, ScanDeletionRequest};
use upload::{run_import, ImportRequest};
use validators::{validate_overwrite_mode, validate_server_url, validate_xnat_identifier};

#[derive(Parser)]
#[command(
    name = "xnat-core",
    version,
    about = "DICOM import/download engine for a neuroimaging data management server"
)]
struct Cli {
    /// Path to a `.env`-style file to load before reading the environment.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive and upload a directory of DICOM files through the REST
    /// import service.
    Import {
        source_dir: PathBuf,
        #[arg(long)]
        project: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        session: String,
        #[arg(long, default_value_t = 4)]
        num_batches: i64,
        #[arg(long, default_value_t = num_cpus::get())]
        upload_workers: usize,
        #[arg(long, default_value_t = num_cpus::get())]
        archive_workers: usize,
        #[arg(long, default_value = "tar")]
        archive_format: String,
        #[arg(long, default_value = "DICOM-zip")]
        import_handler: String,
        #[arg(long, default_value = "none")]
        overwrite: String,
        #[arg(long)]
        overwrite_files: bool,
        #[arg(long)]
        quarantine: bool,
        #[arg(long)]
        trigger_pipelines: bool,
        #[arg(long)]
        rename: bool,
        /// No safe default exists for the server's "direct to archive"
        /// import mode, so this must be chosen explicitly.
        #[arg(long)]
        direct_archive: bool,
        #[arg(long)]
        ignore_unparsable: bool,
        #[arg(long)]
        include_extensionless: bool,
    },
    /// Send a directory of DICOM files via C-STORE, pre-flighted by C-ECHO.
    DicomSend {
        dicom_root: PathBuf,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        called_aet: Option<String>,
        #[arg(long)]
        calling_aet: Option<String>,
        #[arg(long, default_value_t = 4)]
        num_batches: i64,
        #[arg(long)]
        include_extensionless: bool,
        /// Remove the per-run log workspace after sending.
        #[arg(long)]
        cleanup: bool,
    },
    /// Download a session's scans, resources, and optional
    /// assessor/reconstruction bundles, then (optionally) extract into the
    /// canonical layout.
    Download {
        #[arg(long)]
        project: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        session: String,
        out_dir: PathBuf,
        #[arg(long)]
        include_assessors: bool,
        #[arg(long)]
        include_recons: bool,
        #[arg(long, default_value_t = true)]
        parallel: bool,
        #[arg(long, default_value_t = num_cpus::get())]
        max_workers: usize,
        /// Extract the downloaded archives into the canonical layout.
        #[arg(long)]
        extract: bool,
        /// Remove each archive after it has been extracted.
        #[arg(long)]
        unzip_cleanup: bool,
    },
    /// Delete scans from a session, optionally restricted to an explicit
    /// comma-separated id list and/or previewed as a dry run.
    DeleteScans {
        #[arg(long)]
        project: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        session: String,
        /// Comma-separated scan ids. Omit to delete every scan in the
        /// live listing.
        #[arg(long)]
        scan_ids: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = true)]
        parallel: bool,
        #[arg(long, default_value_t = 8)]
        max_workers: usize,
    },
    /// Query the server's build info as a connectivity check.
    Health,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("xnat_core=info")),
        )
        .init();
}

fn build_connection(env: &XnatEnvConfig) -> anyhow::Result<Connection> {
    let server = validate_server_url(&env.server)?;
    Ok(Connection::new(
        server,
        env.username.clone(),
        env.password.clone(),
        env.verify_tls,
        Duration::from_secs(env.http_connect_timeout),
        Duration::from_secs(env.http_read_timeout),
    ))
}

/// Log up to five errors plus a count of any remaining.
fn report_errors(operation: &str, errors: &[String]) {
    tracing::warn!("{operation} finished with {} error(s)", errors.len());
    for error in errors.iter().take(5) {
        tracing::warn!("  {error}");
    }
    if errors.len() > 5 {
        tracing::warn!("  ...and {} more", errors.len() - 5);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let env = XnatEnvConfig::load(cli.env_file.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;

    let exit_ok = match cli.command {
        Commands::Import {
            source_dir,
            project,
            subject,
            session,
            num_batches,
            upload_workers,
            archive_workers,
            archive_format,
            import_handler,
            overwrite,
            overwrite_files,
            quarantine,
            trigger_pipelines,
            rename,
            direct_archive,
            ignore_unparsable,
            include_extensionless,
        } => rt.block_on(async {
            let connection = build_connection(&env)?;
            let project = validate_xnat_identifier(&project)?;
            let subject = validate_xnat_identifier(&subject)?;
            let session = validate_xnat_identifier(&session)?;
            let overwrite = validate_overwrite_mode(&overwrite)?;
            let format = match archive_format.to_lowercase().as_str() {
                "zip" => ArchiveFormat::Zip,
                _ => ArchiveFormat::Tar,
            };
            let (progress, audit) = default_sinks();

            let request = ImportRequest {
                connection,
                source_dir,
                project,
                subject,
                session,
                num_batches,
                upload_workers,
                archive_workers,
                archive_format: format,
                import_handler,
                overwrite,
                overwrite_files,
                quarantine,
                trigger_pipelines,
                rename,
                direct_archive,
                ignore_unparsable,
                include_extensionless,
            };
            let summary = run_import(request, progress, audit).await?;
            if summary.success {
                tracing::info!(
                    "import complete: {} files, {} batches succeeded",
                    summary.total_files,
                    summary.batches_succeeded
                );
            } else {
                report_errors("import", &summary.errors);
            }
            Ok::<bool, anyhow::Error>(summary.success)
        })?,

        Commands::DicomSend {
            dicom_root,
            host,
            port,
            called_aet,
            calling_aet,
            num_batches,
            include_extensionless,
            cleanup,
        } => rt.block_on(async {
            let host = host
                .or_else(|| env.dicom_host.clone())
                .ok_or_else(|| anyhow::anyhow!("DICOM host not set (pass --host or set XNAT_DICOM_HOST)"))?;
            let port = port
                .or(env.dicom_port)
                .ok_or_else(|| anyhow::anyhow!("DICOM port not set (pass --port or set XNAT_DICOM_PORT)"))?;
            let called_aet = called_aet.or_else(|| env.dicom_called_aet.clone()).ok_or_else(|| {
                anyhow::anyhow!("called AE title not set (pass --called-aet or set XNAT_DICOM_CALLED_AET)")
            })?;
            let calling_aet = calling_aet.or_else(|| env.dicom_calling_aet.clone()).ok_or_else(|| {
                anyhow::anyhow!("calling AE title not set (pass --calling-aet or set XNAT_DICOM_CALLING_AET)")
            })?;

            let files = walker::discover_dicom_files(&dicom_root, include_extensionless)?;
            let (progress, audit) = default_sinks();
            let config = DicomSenderConfig {
                dicom_root,
                host,
                port,
                called_aet,
                calling_aet,
                num_batches,
                cleanup,
                socket_timeout: Duration::from_secs(30),
            };
            let summary = run_dicom_send(config, files, progress, audit).await?;
            if summary.success {
                tracing::info!("C-STORE complete: {}/{} sent", summary.sent, summary.total_files);
            } else {
                tracing::warn!(
                    "C-STORE finished with failures: {}/{} sent, {} failed (logs in {})",
                    summary.sent,
                    summary.total_files,
                    summary.failed,
                    summary.log_directory.display()
                );
            }
            Ok::<bool, anyhow::Error>(summary.success)
        })?,

        Commands::Download {
            project,
            subject,
            session,
            out_dir,
            include_assessors,
            include_recons,
            parallel,
            max_workers,
            extract,
            unzip_cleanup,
        } => rt.block_on(async {
            let connection = build_connection(&env)?;
            let project = validate_xnat_identifier(&project)?;
            let subject = validate_xnat_identifier(&subject)?;
            let session_id = validate_xnat_identifier(&session)?;
            let (progress, audit) = default_sinks();

            let request = DownloadSessionRequest {
                connection,
                project,
                subject,
                session: session_id,
                out_dir,
                include_assessors,
                include_recons,
                parallel,
                max_workers,
            };
            let result = download_session(request, progress, audit).await?;
            tracing::info!(
                "downloaded session into {}: {} resource bundle(s)",
                result.session_dir.display(),
                result.resources.len()
            );

            if extract {
                let extracted = extract_session_archives(&result.session_dir)?;
                for archive in &extracted {
                    tracing::info!(
                        "extracted {} -> {} ({} entries)",
                        archive.archive_path.display(),
                        archive.target_dir.display(),
                        archive.entry_count
                    );
                    if unzip_cleanup {
                        let _ = std::fs::remove_file(&archive.archive_path);
                    }
                }
            }
            Ok::<bool, anyhow::Error>(true)
        })?,

        Commands::DeleteScans {
            project,
            subject,
            session,
            scan_ids,
            dry_run,
            parallel,
            max_workers,
        } => rt.block_on(async {
            let connection = build_connection(&env)?;
            let project = validate_xnat_identifier(&project)?;
            let subject = validate_xnat_identifier(&subject)?;
            let session = validate_xnat_identifier(&session)?;
            let scan_ids = scan_ids
                .as_deref()
                .map(validators::parse_scan_ids_input)
                .transpose()?;
            let (_, audit) = default_sinks();

            let request = ScanDeletionRequest {
                connection,
                project,
                subject,
                session,
                scan_ids,
                dry_run,
                parallel,
                max_workers,
            };
            let result = run_scan_deletion(request, audit).await?;
            if result.dry_run {
                tracing::info!(
                    "dry run: {} scan(s) would be skipped, remainder would be deleted",
                    result.skipped.len()
                );
            } else if result.failed.is_empty() {
                tracing::info!("deleted {} scan(s)", result.deleted.len());
            } else {
                let errors: Vec<String> = result
                    .failed
                    .iter()
                    .map(|(id, reason)| format!("{id}: {reason}"))
                    .collect();
                report_errors("scan deletion", &errors);
            }
            Ok::<bool, anyhow::Error>(result.failed.is_empty())
        })?,

        Commands::Health => rt.block_on(async {
            let connection = build_connection(&env)?;
            let version = connection.health_check().await?;
            tracing::info!("server version: {version}");
            Ok::<bool, anyhow::Error>(true)
        })?,
    };

    if !exit_ok {
        std::process::exit(1);
    }
    Ok(())
}
