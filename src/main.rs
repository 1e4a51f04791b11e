//! cutover CLI
//!
//! Entry point for the `cutover` command-line tool. Exit codes: 0 success;
//! 1 validation/operational failure with the machine untouched or safely
//! reverted; 2 fatal/unsafe state requiring operator intervention.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cutover::builder::Builder;
use cutover::config::{Config, CONFIG_FILENAME};
use cutover::engine::{
    read_manifest_from_archive, CommandProbe, CommandSupervisor, CutoverEngine, DeployError,
    DeployKind, DeployReport,
};
use cutover::manifest::{Channel, ReleaseManifest};
use cutover::preflight::{self, GatherSpec, MachineState};
use cutover::signing::{
    self, evaluate_signature, DetachedSignature, SignatureStatus,
};
use cutover::store::{ReleaseStore, SharedState, StoreError};

const EXIT_FAILURE: i32 = 1;
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "cutover")]
#[command(about = "Release packaging, verification, and atomic deployment", version)]
struct Cli {
    /// Path to cutover.toml (default: ./cutover.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an Ed25519 signing keypair
    Keygen {
        /// Directory to write cutover.key and cutover.pub into
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Build a release artifact from a source tree
    Build {
        /// Release version (default: derived from git describe)
        #[arg(long)]
        version: Option<String>,

        /// Release channel: stable, beta, dev
        #[arg(long, default_value = "stable")]
        channel: String,

        /// Sign the artifact with this key
        #[arg(long)]
        key: Option<PathBuf>,

        /// Source tree root
        #[arg(long, default_value = ".")]
        source: PathBuf,

        /// Output directory (default: [build].out_dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Sign an existing artifact
    Sign {
        /// Artifact path
        artifact: PathBuf,

        /// Signing key file
        #[arg(long)]
        key: PathBuf,
    },

    /// Verify an artifact's checksum and signature
    Verify {
        /// Artifact path
        artifact: PathBuf,

        /// Public key file (default: [deploy].public_key)
        #[arg(long)]
        pubkey: Option<PathBuf>,
    },

    /// Validate a manifest or artifact against this machine
    Preflight {
        /// Release archive or manifest.json
        target: PathBuf,
    },

    /// Install the first release onto this machine
    Install {
        /// Release archive
        artifact: PathBuf,
    },

    /// Upgrade the active release
    Upgrade {
        /// Release archive
        artifact: PathBuf,
    },

    /// Roll back to the most recent previously-served release
    Rollback,

    /// List installed releases
    Releases,

    /// Remove one release from the store (never automatic)
    Prune {
        /// Version to remove
        version: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { out_dir } => run_keygen(&out_dir, cli.json),
        Commands::Build {
            version,
            channel,
            key,
            source,
            out,
        } => run_build(cli.config, version, &channel, key, &source, out, cli.json),
        Commands::Sign { artifact, key } => run_sign(&artifact, &key, cli.json),
        Commands::Verify { artifact, pubkey } => {
            run_verify(cli.config, &artifact, pubkey, cli.json)
        }
        Commands::Preflight { target } => run_preflight(cli.config, &target, cli.json),
        Commands::Install { artifact } => {
            run_deploy(cli.config, DeployKind::Install, &artifact, cli.json)
        }
        Commands::Upgrade { artifact } => {
            run_deploy(cli.config, DeployKind::Upgrade, &artifact, cli.json)
        }
        Commands::Rollback => run_rollback(cli.config, cli.json),
        Commands::Releases => run_releases(cli.config, cli.json),
        Commands::Prune { version } => run_prune(cli.config, &version),
    }
}

fn load_config(path: Option<PathBuf>) -> Config {
    match Config::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            process::exit(EXIT_FAILURE);
        }
    }
}

fn run_keygen(out_dir: &Path, json: bool) {
    let key = signing::generate_keypair();
    let verifying = key.verifying_key();
    let fingerprint = signing::compute_key_fingerprint(&verifying);

    let key_path = out_dir.join("cutover.key");
    let pub_path = out_dir.join("cutover.pub");
    if let Err(e) = fs::create_dir_all(out_dir)
        .and_then(|_| fs::write(&key_path, signing::encode_signing_key(&key)))
        .and_then(|_| fs::write(&pub_path, signing::encode_verifying_key(&verifying)))
    {
        eprintln!("Error writing keys: {e}");
        process::exit(EXIT_FAILURE);
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "signing_key": key_path,
                "public_key": pub_path,
                "fingerprint": fingerprint,
            })
        );
    } else {
        println!("Signing key: {}", key_path.display());
        println!("Public key:  {}", pub_path.display());
        println!("Fingerprint: {fingerprint}");
    }
}

fn run_build(
    config_path: Option<PathBuf>,
    version: Option<String>,
    channel: &str,
    key_path: Option<PathBuf>,
    source: &Path,
    out: Option<PathBuf>,
    json: bool,
) {
    // A build reads the config from the source tree unless told otherwise.
    let config_path = config_path.or_else(|| {
        let in_source = source.join(CONFIG_FILENAME);
        in_source.exists().then_some(in_source)
    });
    let config = load_config(config_path);

    let version = match version.map(|v| semver::Version::parse(v.trim_start_matches('v'))) {
        Some(Ok(v)) => Some(v),
        Some(Err(e)) => {
            eprintln!("Invalid version: {e}");
            process::exit(EXIT_FAILURE);
        }
        None => None,
    };
    let channel: Channel = match channel.parse() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            process::exit(EXIT_FAILURE);
        }
    };
    let signing_key = key_path.map(|path| match signing::load_signing_key(&path) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("Error loading signing key: {e}");
            process::exit(EXIT_FAILURE);
        }
    });

    let out_dir = out.unwrap_or_else(|| config.out_dir());
    let builder = Builder::new(source.to_path_buf(), out_dir, config.build_spec());

    match builder.build(version, channel, signing_key.as_ref()) {
        Ok(report) => {
            for warning in &report.warnings {
                eprintln!("WARNING: {warning}");
            }
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "artifact": report.artifact,
                        "sha256": report.artifact_sha256,
                        "manifest": report.manifest,
                        "signed": report.signature_file.is_some(),
                        "warnings": report.warnings,
                    })
                );
            } else {
                println!("Built {}", report.artifact.display());
                println!("  version:  {}", report.manifest.version);
                println!("  sha256:   {}", report.artifact_sha256);
                println!("  signed:   {}", report.signature_file.is_some());
            }
        }
        Err(e) => {
            eprintln!("Build failed: {e}");
            process::exit(EXIT_FAILURE);
        }
    }
}

fn run_sign(artifact: &Path, key_path: &Path, json: bool) {
    let key = match signing::load_signing_key(key_path) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("Error loading signing key: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    let bytes = match fs::read(artifact) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error reading artifact: {e}");
            process::exit(EXIT_FAILURE);
        }
    };

    let signature = DetachedSignature::sign(&bytes, &key);
    let sig_path = signing::signature_path(artifact);
    if let Err(e) = signature.write_to_file(&sig_path) {
        eprintln!("Error writing signature: {e}");
        process::exit(EXIT_FAILURE);
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "signature": sig_path,
                "fingerprint": signature.pubkey_fingerprint,
            })
        );
    } else {
        println!("Signed {} (signer {})", sig_path.display(), signature.pubkey_fingerprint);
    }
}

fn run_verify(config_path: Option<PathBuf>, artifact: &Path, pubkey: Option<PathBuf>, json: bool) {
    let config = load_config(config_path);
    let pubkey_path = pubkey.or(config.deploy.public_key.clone());
    let verifying_key = match pubkey_path.map(|p| signing::load_verifying_key(&p)) {
        Some(Ok(key)) => Some(key),
        Some(Err(e)) => {
            eprintln!("Error loading public key: {e}");
            process::exit(EXIT_FAILURE);
        }
        None => None,
    };

    // Checksum and signature are independent checks; both are reported.
    let checksum_ok = signing::verify_checksum_file(artifact).unwrap_or(false);
    let signature = evaluate_signature(artifact, verifying_key.as_ref());

    if json {
        println!(
            "{}",
            serde_json::json!({
                "artifact": artifact,
                "checksum_ok": checksum_ok,
                "signature": signature,
            })
        );
    } else {
        println!("Artifact:  {}", artifact.display());
        println!("Checksum:  {}", if checksum_ok { "ok" } else { "MISMATCH" });
        match &signature {
            SignatureStatus::Valid { fingerprint } => {
                println!("Signature: valid (signer {fingerprint})")
            }
            SignatureStatus::Missing => println!("Signature: missing"),
            SignatureStatus::Invalid { reason } => println!("Signature: INVALID ({reason})"),
        }
    }

    // A corrupt artifact or a bad signature is an integrity failure; a
    // missing signature alone is tolerated for development builds.
    if !checksum_ok || matches!(signature, SignatureStatus::Invalid { .. }) {
        process::exit(EXIT_FAILURE);
    }
}

fn run_preflight(config_path: Option<PathBuf>, target: &Path, json: bool) {
    let config = load_config(config_path);

    let is_manifest = target.extension().is_some_and(|e| e == "json");
    let (manifest, signature) = if is_manifest {
        let manifest = match ReleaseManifest::from_file(target) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Error reading manifest: {e}");
                process::exit(EXIT_FAILURE);
            }
        };
        // A bare manifest has no artifact bytes to verify.
        (manifest, SignatureStatus::Missing)
    } else {
        let manifest = match read_manifest_from_archive(target) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Error reading artifact: {e}");
                process::exit(EXIT_FAILURE);
            }
        };
        let options = match config.engine_options() {
            Ok(o) => o,
            Err(e) => {
                eprintln!("{e}");
                process::exit(EXIT_FAILURE);
            }
        };
        let signature = evaluate_signature(target, options.verifying_key.as_ref());
        (manifest, signature)
    };

    let store = match ReleaseStore::open(config.store_root()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening store: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    let active_version = match store.active_version() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Error resolving active release: {e}");
            process::exit(EXIT_FATAL);
        }
    };

    let machine = MachineState::gather(&GatherSpec {
        install_root: &config.store_root(),
        required_dirs: vec![config.store_root(), config.shared_dir()],
        runtime_version_command: config.runtime.version_command.clone(),
        service_status_command: config.service.status_command.clone(),
        active_version,
    });

    let report = preflight::evaluate(&manifest, &machine, &signature);

    if json {
        println!("{}", report.to_json().unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}")));
    } else {
        print!("{}", report.to_human());
    }

    if !report.passed() {
        process::exit(EXIT_FAILURE);
    }
}

fn run_deploy(config_path: Option<PathBuf>, kind: DeployKind, artifact: &Path, json: bool) {
    let config = load_config(config_path);

    let store = match ReleaseStore::open(config.store_root()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening store: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    let shared = match SharedState::open(config.shared_dir()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening shared state: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    let options = match config.engine_options() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{e}");
            process::exit(EXIT_FAILURE);
        }
    };

    let probe = CommandProbe::new(config.health.command.clone());
    let supervisor = CommandSupervisor::new(
        config.supervisor.start.clone(),
        config.supervisor.stop.clone(),
        config.supervisor.restart.clone(),
    );

    // Ctrl-C requests cancellation; the engine honors it only before the
    // pointer swap, after which the deployment runs to a terminal state.
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("cancellation requested; finishing current step");
        cancel_flag.store(true, Ordering::SeqCst);
    }) {
        eprintln!("WARNING: could not install signal handler: {e}");
    }

    let engine = CutoverEngine::new(&store, &shared, &probe, &supervisor, options)
        .with_cancel(cancel);

    match engine.deploy(kind, artifact) {
        Ok(report) => finish_deploy(report, json),
        Err(e) => fail_deploy(e, json),
    }
}

fn run_rollback(config_path: Option<PathBuf>, json: bool) {
    let config = load_config(config_path);

    let store = match ReleaseStore::open(config.store_root()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening store: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    let shared = match SharedState::open(config.shared_dir()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening shared state: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    let options = match config.engine_options() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{e}");
            process::exit(EXIT_FAILURE);
        }
    };

    let probe = CommandProbe::new(config.health.command.clone());
    let supervisor = CommandSupervisor::new(
        config.supervisor.start.clone(),
        config.supervisor.stop.clone(),
        config.supervisor.restart.clone(),
    );
    let engine = CutoverEngine::new(&store, &shared, &probe, &supervisor, options);

    match engine.rollback() {
        Ok(report) => finish_deploy(report, json),
        Err(e) => fail_deploy(e, json),
    }
}

fn finish_deploy(report: DeployReport, json: bool) {
    if json {
        println!(
            "{}",
            report.to_json().unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
        );
    } else {
        print!("{}", report.to_human());
    }

    if !report.committed() {
        // Safely reverted, but the requested release is not serving.
        process::exit(EXIT_FAILURE);
    }
}

fn fail_deploy(error: DeployError, json: bool) -> ! {
    if let DeployError::Validation(report) = &error {
        if json {
            println!(
                "{}",
                report.to_json().unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
            );
        } else {
            print!("{}", report.to_human());
        }
    }
    eprintln!("Error: {error}");
    process::exit(exit_code_for(&error));
}

fn exit_code_for(error: &DeployError) -> i32 {
    match error {
        // Loss of the core safety invariant: halt for the operator.
        DeployError::Cutover(_)
        | DeployError::Rollback(_)
        | DeployError::FirstInstallUnhealthy(_)
        | DeployError::InvalidTransition { .. } => EXIT_FATAL,
        _ => EXIT_FAILURE,
    }
}

fn run_releases(config_path: Option<PathBuf>, json: bool) {
    let config = load_config(config_path);
    let store = match ReleaseStore::open(config.store_root()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening store: {e}");
            process::exit(EXIT_FAILURE);
        }
    };

    let active = store.active_version().unwrap_or(None);
    let entries = match store.installed() {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Error listing releases: {e}");
            process::exit(EXIT_FAILURE);
        }
    };

    if json {
        println!(
            "{}",
            serde_json::json!({
                "active": active.as_ref().map(|v| v.to_string()),
                "releases": entries,
            })
        );
    } else if entries.is_empty() {
        println!("No releases installed");
    } else {
        for entry in entries {
            let marker = if Some(&entry.version) == active.as_ref() {
                " (active)"
            } else if !entry.complete {
                " (incomplete)"
            } else {
                ""
            };
            println!("{}{marker}", entry.version);
        }
    }
}

fn run_prune(config_path: Option<PathBuf>, version: &str) {
    let config = load_config(config_path);
    let version = match semver::Version::parse(version) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Invalid version: {e}");
            process::exit(EXIT_FAILURE);
        }
    };

    let store = match ReleaseStore::open(config.store_root()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening store: {e}");
            process::exit(EXIT_FAILURE);
        }
    };

    match store.prune(&version) {
        Ok(()) => println!("Pruned {version}"),
        Err(e @ StoreError::CannotPrune { .. }) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_FAILURE);
        }
        Err(e) => {
            eprintln!("Error pruning {version}: {e}");
            process::exit(EXIT_FAILURE);
        }
    }
}
