//! Thin CLI layer: parse args, styled output, and call into nah-core.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::{Arg, ArgAction, Command};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nah_core::manifest::host::{parse_host, HostManifest};
use nah_core::manifest::nap::parse_nap;
use nah_core::nak_compose::{self, ConflictPolicy, NakComposeOptions, NakReference};
use nah_core::{compose, query, registry, resolver};

fn use_color() -> bool {
    std::io::stdout().is_terminal() && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() { println!("{}", msg.green()) } else { println!("{}", msg) }
}

fn error(msg: &str) {
    if use_color() { eprintln!("{}", msg.red()) } else { eprintln!("{}", msg) }
}

fn info(msg: &str) {
    if use_color() { println!("{}", msg.cyan()) } else { println!("{}", msg) }
}

fn dim(msg: &str) {
    if use_color() { println!("{}", msg.dimmed()) } else { println!("{}", msg) }
}

/// Runs a fetch-and-install on a worker thread, showing a spinner while
/// it's in flight unless `quiet` is false (verbose mode prints its own
/// progress instead, so the two don't compete for the terminal).
fn run_with_spinner<T, F>(message: &str, quiet: bool, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if !quiet {
        return f();
    }
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().tick_chars("⠁⠂⠄⠈⠐⠠⠰⠸⠹").template("{spinner:.dim} {msg}").unwrap());
    spinner.set_message(message.to_string());
    loop {
        match rx.try_recv() {
            Ok(result) => {
                spinner.finish_and_clear();
                return result;
            }
            Err(mpsc::TryRecvError::Empty) => {
                spinner.tick();
                thread::sleep(Duration::from_millis(80));
            }
            Err(mpsc::TryRecvError::Disconnected) => unreachable!("worker thread never panics without sending"),
        }
    }
}

struct ExitCode(i32);

fn root_from(matches: &clap::ArgMatches) -> PathBuf {
    nah_core::config::resolve_root(matches.get_one::<String>("root").map(|s| s.as_str()))
}

fn load_host_manifest(root: &Path) -> Result<HostManifest, ExitCode> {
    let path = registry::host_manifest_path(root);
    if !path.is_file() {
        return Ok(HostManifest::default());
    }
    let bytes = std::fs::read(&path).map_err(|e| {
        error(&format!("reading host manifest: {}", e));
        ExitCode(6)
    })?;
    parse_host(&bytes).map_err(|e| {
        error(&e.to_string());
        ExitCode(4)
    })
}

fn exit_code_for(err: &nah_core::NahError) -> i32 {
    use nah_core::ErrorKind::*;
    match err.kind {
        InvalidManifest | InvalidReference => 2,
        NotInstalled | NakNotInstalled => 3,
        HashMismatch | InsecureScheme => 4,
        NakVersionUnsatisfiable | NakPinDrifted | AmbiguousLoaders | FileConflict | EnvCycle | UnknownPlaceholder => 5,
        ArchiveUnsafe | IoError => 6,
    }
}

fn run() -> Result<(), ExitCode> {
    let root_arg = Arg::new("root").long("root").global(true).help("NAH root directory (default: $NAH_ROOT or $HOME/.nah)");
    let json_arg = Arg::new("json").long("json").global(true).action(ArgAction::SetTrue).help("Output machine-readable JSON");
    let verbose_arg = Arg::new("verbose").long("verbose").global(true).action(ArgAction::SetTrue).help("Verbose logging");

    let matches = Command::new("nah")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Native App Host: installs and composes NAPs and NAKs into launch contracts")
        .after_help("Examples:\n  nah install file:./app.nap\n  nah list apps\n  nah run com.example.app\n  nah nak compose --output com.example.combined@1.0.0 --loader-from com.example.sdk a b")
        .arg(root_arg.clone())
        .arg(json_arg.clone())
        .arg(verbose_arg.clone())
        .subcommand(
            Command::new("install")
                .about("Install a NAP or NAK from a file: or https: reference")
                .arg(Arg::new("reference").required(true).help("file:<path> or https://...#sha256=<hex>"))
                .arg(Arg::new("force").long("force").action(ArgAction::SetTrue).help("Replace an existing install of the same id@version")),
        )
        .subcommand(
            Command::new("list")
                .about("List installed apps or NAKs")
                .arg(Arg::new("kind").value_parser(["apps", "naks"]).default_value("apps")),
        )
        .subcommand(
            Command::new("show")
                .about("Show an installed app or NAK record")
                .arg(Arg::new("kind").value_parser(["app", "nak"]).required(true))
                .arg(Arg::new("id").required(true))
                .arg(Arg::new("version").required(false)),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove an installed app or NAK")
                .arg(Arg::new("kind").value_parser(["app", "nak"]).required(true))
                .arg(Arg::new("id").required(true))
                .arg(Arg::new("version").required(true)),
        )
        .subcommand(
            Command::new("pack")
                .about("Package a directory containing nap.json or nak.json into a deterministic archive")
                .arg(Arg::new("dir").required(true))
                .arg(Arg::new("out").required(true)),
        )
        .subcommand(
            Command::new("run")
                .about("Compose and exec an installed app")
                .arg(Arg::new("reference").required(true).help("<id>[@<version>]"))
                .arg(Arg::new("trace").long("trace").action(ArgAction::SetTrue).help("Print the composition trace"))
                .arg(Arg::new("args").num_args(0..).help("Arguments appended to the app's own arguments")),
        )
        .subcommand(
            Command::new("nak")
                .about("NAK-level operations")
                .subcommand(
                    Command::new("compose")
                        .about("Merge several installed NAKs into one synthesized NAK")
                        .arg(Arg::new("input").required(true).num_args(1..).help("Installed NAK references (<id>@<version>)"))
                        .arg(Arg::new("output").long("output").required(true).help("<id>@<version> for the synthesized NAK"))
                        .arg(Arg::new("on-conflict").long("on-conflict").value_parser(["error", "first", "last"]).default_value("error"))
                        .arg(Arg::new("loader-from").long("loader-from").help("id of the input whose loaders to keep when more than one input defines loaders"))
                        .arg(Arg::new("resource-root").long("resource-root").help("resource_root to use when inputs disagree"))
                        .arg(Arg::new("out-archive").long("out-archive").help("Repackage the result as a .nak archive at this path")),
                ),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        env::set_var("NAH_LOG_LEVEL", "debug");
    }

    let root = root_from(&matches);
    let fetch_cfg = nah_core::config::FetchConfig::from_env();
    let cancel = nah_core::fetch::CancelToken::new();

    match matches.subcommand() {
        Some(("install", sub)) => {
            let reference = sub.get_one::<String>("reference").unwrap().clone();
            let force = sub.get_flag("force");
            let options = nah_core::InstallOptions { force, installed_by: "nah-cli".to_string() };
            let quiet = !matches.get_flag("verbose");
            let task_root = root.clone();
            let outcome = run_with_spinner("installing...", quiet, move || {
                nah_core::install(&task_root, &reference, &options, &fetch_cfg, &cancel)
            })
            .map_err(|e| {
                error(&e.to_string());
                ExitCode(exit_code_for(&e))
            })?;
            match outcome {
                nah_core::InstallOutcome::App(record) => success(&format!("Installed {}@{}", record.app.id, record.app.version)),
                nah_core::InstallOutcome::Nak(record) => success(&format!("Installed {}@{}", record.id, record.version)),
            }
        }
        Some(("list", sub)) => {
            let json_out = matches.get_flag("json");
            match sub.get_one::<String>("kind").map(|s| s.as_str()).unwrap_or("apps") {
                "naks" => {
                    let naks = query::list_naks(&root).map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;
                    if json_out {
                        println!("{}", serde_json::to_string_pretty(&naks).unwrap());
                    } else if naks.is_empty() {
                        dim("No NAKs installed.");
                    } else {
                        for n in naks {
                            println!("{}@{}", n.id, n.version);
                        }
                    }
                }
                _ => {
                    let apps = query::list_apps(&root).map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;
                    if json_out {
                        println!("{}", serde_json::to_string_pretty(&apps).unwrap());
                    } else if apps.is_empty() {
                        dim("No apps installed.");
                    } else {
                        for a in apps {
                            println!("{}@{}", a.app.id, a.app.version);
                        }
                    }
                }
            }
        }
        Some(("show", sub)) => {
            let id = sub.get_one::<String>("id").unwrap();
            let version = sub.get_one::<String>("version").map(|s| s.as_str());
            let json_out = matches.get_flag("json");
            match sub.get_one::<String>("kind").unwrap().as_str() {
                "nak" => {
                    let version = version.ok_or_else(|| { error("a version is required for `show nak`"); ExitCode(2) })?;
                    let record = query::show_nak(&root, id, version).map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;
                    println!("{}", serde_json::to_string_pretty(&record).unwrap());
                }
                _ => {
                    let record = match version {
                        Some(v) => query::show_app(&root, id, v),
                        None => query::show_app_latest(&root, id),
                    }
                    .map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;
                    if json_out {
                        println!("{}", serde_json::to_string_pretty(&record).unwrap());
                    } else {
                        println!("{}@{} -> {}", record.app.id, record.app.version, record.paths.install_root);
                    }
                }
            }
        }
        Some(("remove", sub)) => {
            let id = sub.get_one::<String>("id").unwrap();
            let version = sub.get_one::<String>("version").unwrap();
            match sub.get_one::<String>("kind").unwrap().as_str() {
                "nak" => {
                    nah_core::remove_nak(&root, id, version).map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;
                }
                _ => {
                    nah_core::remove_app(&root, id, version).map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;
                }
            }
            success(&format!("Removed {}@{}", id, version));
        }
        Some(("pack", sub)) => {
            let dir = Path::new(sub.get_one::<String>("dir").unwrap());
            let out = Path::new(sub.get_one::<String>("out").unwrap());
            let sha = nah_core::pack(dir, out).map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;
            success(&format!("Packed {} -> {} ({})", dir.display(), out.display(), sha));
        }
        Some(("run", sub)) => {
            let reference = sub.get_one::<String>("reference").unwrap();
            let trace = sub.get_flag("trace");
            let (id, version) = match reference.rsplit_once('@') {
                Some((id, version)) if !id.is_empty() => (id.to_string(), Some(version.to_string())),
                _ => (reference.clone(), None),
            };
            let app_record = match version {
                Some(v) => query::show_app(&root, &id, &v),
                None => query::show_app_latest(&root, &id),
            }
            .map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;

            let manifest_path = Path::new(&app_record.paths.install_root).join(nah_core::archive::NAP_MANIFEST);
            let bytes = std::fs::read(&manifest_path).map_err(|e| { error(&format!("reading app manifest: {}", e)); ExitCode(6) })?;
            let parsed = parse_nap(&bytes).map_err(|e| { error(&e.to_string()); ExitCode(2) })?;

            let snapshot = registry::scan(&root).map_err(|e| { error(&e.to_string()); ExitCode(6) })?;
            let nak_record = match (&app_record.nak, &app_record.app.nak_id) {
                (Some(pinned), _) => Some(
                    resolver::check_pin_still_valid(&snapshot, &pinned.id, &pinned.version, app_record.app.nak_version_req.as_deref().unwrap_or(""))
                        .and_then(|_| {
                            snapshot.find_nak(&pinned.id, &pinned.version).cloned().ok_or_else(|| {
                                nah_core::NahError::new(nah_core::ErrorKind::NakNotInstalled, "run", "pinned NAK record missing")
                            })
                        })
                        .map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?,
                ),
                (None, Some(nak_id)) => {
                    let range = app_record.app.nak_version_req.as_deref().unwrap_or(">=0.0.0");
                    Some(resolver::resolve_nak(&snapshot, nak_id, range).map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?.clone())
                }
                (None, None) => None,
            };

            let host_manifest = load_host_manifest(&root)?;
            let process_env: BTreeMap<String, String> = env::vars().collect();
            let outcome = compose(nah_core::ComposeInput {
                app_record: &app_record,
                app_manifest: &parsed.manifest,
                nak_record: nak_record.as_ref(),
                host_manifest: &host_manifest,
                process_env: &process_env,
                options: nah_core::ComposeOptions { trace },
            });

            if trace {
                if let Some(steps) = &outcome.trace {
                    for step in steps {
                        info(&format!("[{}] {}", step.step, step.description));
                    }
                }
            }
            for w in &outcome.warnings {
                eprintln!("warning: {} ({})", w.kind, w.detail);
            }
            let contract = outcome.contract.ok_or_else(|| {
                let err = outcome.critical_error.clone().unwrap();
                error(&err.to_string());
                ExitCode(exit_code_for(&err))
            })?;

            let extra_args: Vec<String> = sub.get_many::<String>("args").map(|it| it.cloned().collect()).unwrap_or_default();
            let mut command = std::process::Command::new(&contract.execution.binary);
            command.args(&contract.execution.arguments).args(&extra_args);
            command.current_dir(&contract.execution.cwd);
            command.env_clear();
            for (k, v) in &contract.environment {
                command.env(k, v);
            }
            if !contract.execution.library_paths.is_empty() {
                command.env(&contract.execution.library_path_env_key, contract.execution.library_paths.join(":"));
            }
            let status = command.status().map_err(|e| { error(&format!("exec failed: {}", e)); ExitCode(6) })?;
            let code = match status.code() {
                Some(0) => 0,
                Some(c) => 64 + c,
                None => 64,
            };
            std::process::exit(code);
        }
        Some(("nak", sub)) => {
            if let Some(("compose", sub)) = sub.subcommand() {
                let inputs_arg: Vec<&str> = sub.get_many::<String>("input").unwrap().map(|s| s.as_str()).collect();
                let output = sub.get_one::<String>("output").unwrap();
                let (out_id, out_version) = output.rsplit_once('@').ok_or_else(|| { error("--output must be <id>@<version>"); ExitCode(2) })?;

                let on_conflict = match sub.get_one::<String>("on-conflict").map(|s| s.as_str()) {
                    Some("first") => ConflictPolicy::First,
                    Some("last") => ConflictPolicy::Last,
                    _ => ConflictPolicy::Error,
                };
                let loader_from = sub.get_one::<String>("loader-from").cloned();
                let resource_root = sub.get_one::<String>("resource-root").cloned();
                let out_archive = sub.get_one::<String>("out-archive").map(PathBuf::from);

                let snapshot = registry::scan(&root).map_err(|e| { error(&e.to_string()); ExitCode(6) })?;
                let staging_parent = root.join("tmp").join("nak-compose");
                let mut resolved = Vec::new();
                for spec in &inputs_arg {
                    let (id, version) = spec.rsplit_once('@').ok_or_else(|| { error("each input must be <id>@<version>"); ExitCode(2) })?;
                    let input = nak_compose::resolve_reference(&NakReference::Installed { id, version }, Some(&snapshot), &staging_parent)
                        .map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;
                    resolved.push(input);
                }

                let options = NakComposeOptions { on_conflict, loader_from, resource_root, generate_provenance: true, ..Default::default() };
                let identity = nah_core::manifest::nak::NakIdentity { id: out_id.to_string(), version: out_version.to_string() };
                let compose_outcome = nak_compose::compose_naks(&resolved, &options, identity, &staging_parent, out_archive.as_deref())
                    .map_err(|e| { error(&e.to_string()); ExitCode(exit_code_for(&e)) })?;

                success(&format!("Composed {} at {}", output, compose_outcome.staging_dir.display()));
                if let Some(sha) = compose_outcome.archive_sha256 {
                    info(&format!("Archive sha256: {}", sha));
                }
            } else {
                error("use `nah nak compose`");
                return Err(ExitCode(2));
            }
        }
        _ => {
            if use_color() {
                println!("{}", "nah".bright_cyan().bold());
                dim("Native App Host — installs and composes NAPs and NAKs into launch contracts.");
            } else {
                println!("nah — Native App Host");
            }
            dim("\nRun `nah --help` for details.");
        }
    }

    Ok(())
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(ExitCode(c))) => c,
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
