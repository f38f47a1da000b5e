//! The composer (§4.I): a pure function from (app record, app manifest,
//! NAK record?, host manifest) to a Launch Contract. No I/O, no
//! logging — preconditions and structured outcomes stay separate from
//! side effects, carried here into a function with no side effects at
//! all, since composition never touches disk or the network.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::env_algebra::{self, WellKnownPlaceholders};
use crate::error::{ErrorKind, NahError};
use crate::manifest::host::HostManifest;
use crate::manifest::nak::Loader;
use crate::manifest::nap::NapManifest;
use crate::manifest::record::{AppInstallRecord, NakInstallRecord, TrustState};
use crate::paths::safe_join;

#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub trace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub step: String,
    pub description: String,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeWarning {
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractApp {
    pub id: String,
    pub version: String,
    pub root: String,
    pub entrypoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractNak {
    pub id: String,
    pub version: String,
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractExecution {
    pub binary: String,
    pub cwd: String,
    pub arguments: Vec<String>,
    pub library_path_env_key: String,
    pub library_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractTrust {
    pub state: TrustState,
    pub source: String,
}

/// The composer's output (§3 "Launch Contract"). Every path carried
/// here is absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchContract {
    pub app: ContractApp,
    pub nak: Option<ContractNak>,
    pub execution: ContractExecution,
    pub environment: Vec<(String, String)>,
    pub trust: ContractTrust,
}

/// Everything `compose` needs, already loaded from disk by the caller
/// — composition itself performs no I/O.
pub struct ComposeInput<'a> {
    pub app_record: &'a AppInstallRecord,
    pub app_manifest: &'a NapManifest,
    pub nak_record: Option<&'a NakInstallRecord>,
    pub host_manifest: &'a HostManifest,
    pub process_env: &'a BTreeMap<String, String>,
    pub options: ComposeOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeOutcome {
    pub contract: Option<LaunchContract>,
    pub warnings: Vec<ComposeWarning>,
    pub trace: Option<Vec<TraceStep>>,
    pub critical_error: Option<NahError>,
}

fn library_path_env_key() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(target_os = "windows") {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

fn dedup_preserve_first(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// Picks which NAK loader (if any) a single composition should wrap
/// the entrypoint with: the only one if there's exactly one, else the
/// entry named `default` if present. Multiple ambiguous named loaders
/// with no `default` is a NAK-compose-time concern (§4.J); a single
/// app composition simply has nothing to disambiguate with, so it
/// falls back to the lexicographically-first entry, matching the NAK
/// manifest's `BTreeMap` iteration order.
fn select_loader<'a>(nak: &'a NakInstallRecord) -> Option<(&'a String, &'a Loader)> {
    if nak.loaders.len() == 1 {
        return nak.loaders.iter().next();
    }
    if let Some(entry) = nak.loaders.get_key_value("default") {
        return Some(entry);
    }
    nak.loaders.iter().next()
}

/// Runs the full seven-step procedure of §4.I, returning a
/// `ComposeOutcome` that is never an `Err` — precondition violations
/// are reported through `critical_error` instead.
pub fn compose(input: ComposeInput) -> ComposeOutcome {
    let mut warnings = Vec::new();
    let mut trace = Vec::new();
    let record_step = |trace: &mut Vec<TraceStep>, step: &str, description: &str, detail: serde_json::Value| {
        if input.options.trace {
            trace.push(TraceStep { step: step.to_string(), description: description.to_string(), detail });
        }
    };

    // Step 1: pin check.
    if let Some(nak_id) = &input.app_record.app.nak_id {
        let satisfied = match (input.nak_record, &input.app_record.app.nak_version_req) {
            (Some(nak), Some(range_spec)) => crate::semver_range::VersionRange::parse(range_spec)
                .ok()
                .zip(crate::semver_range::parse_version(&nak.version).ok())
                .map(|(range, version)| range.matches(&version))
                .unwrap_or(false),
            _ => false,
        };
        record_step(
            &mut trace,
            "nak_pin_check",
            "verify the pinned NAK still satisfies the app's declared range",
            serde_json::json!({ "nak_id": nak_id, "satisfied": satisfied }),
        );
        if !satisfied {
            return ComposeOutcome {
                contract: None,
                warnings,
                trace: input.options.trace.then_some(trace),
                critical_error: Some(
                    NahError::new(ErrorKind::NakPinDrifted, "compose", "pinned NAK no longer satisfies the app's range")
                        .with_details(serde_json::json!({ "nak_id": nak_id })),
                ),
            };
        }
    }

    let app_root = std::path::Path::new(&input.app_record.paths.install_root);

    // Step 2: library_paths.
    let mut library_paths: Vec<String> = Vec::new();
    library_paths.extend(input.host_manifest.paths.library_prepend.clone());
    library_paths.extend(input.app_record.overrides.paths.library_prepend.clone());
    if let Some(nak) = input.nak_record {
        library_paths.extend(nak.paths.lib_dirs.clone());
    }
    for rel in &input.app_manifest.app.layout.lib_dirs {
        match safe_join(app_root, rel) {
            Ok(abs) => library_paths.push(abs.to_string_lossy().to_string()),
            Err(e) => {
                return ComposeOutcome {
                    contract: None,
                    warnings,
                    trace: input.options.trace.then_some(trace),
                    critical_error: Some(e),
                };
            }
        }
    }
    library_paths.extend(input.host_manifest.paths.library_append.clone());
    let library_paths = dedup_preserve_first(library_paths);
    record_step(
        &mut trace,
        "library_paths",
        "concatenate host/override/nak/app library dirs, dedup preserving first occurrence",
        serde_json::json!({ "library_paths": library_paths }),
    );

    // Step 3: platform library path env key.
    let path_env_key = library_path_env_key();
    record_step(&mut trace, "platform_key", "select library-path environment variable by target platform", serde_json::json!({ "key": path_env_key }));

    // Step 4: environment fold.
    let nak_env = input.nak_record.map(|n| &n.environment).cloned().unwrap_or_default();
    let host_env = input.host_manifest.environment.clone();
    let app_env = input.app_manifest.app.execution.environment.clone();
    let override_env = input.app_record.overrides.environment.clone();
    let process_base = env_algebra::process_env_base(input.process_env);
    let folded = match env_algebra::fold_layers_from(process_base.clone(), &[&nak_env, &host_env, &app_env, &override_env]) {
        Ok(f) => f,
        Err(e) => {
            return ComposeOutcome { contract: None, warnings, trace: input.options.trace.then_some(trace), critical_error: Some(e) };
        }
    };

    let override_keys: Vec<String> = override_env.keys().cloned().collect();
    let pre_override: BTreeMap<String, Option<String>> =
        match env_algebra::fold_layers_from(process_base, &[&nak_env, &host_env, &app_env]) {
            Ok(f) => f,
            Err(e) => {
                return ComposeOutcome { contract: None, warnings, trace: input.options.trace.then_some(trace), critical_error: Some(e) };
            }
        };
    let mut folded = folded;
    let blocked = env_algebra::enforce_override_policy(
        &mut folded,
        &pre_override,
        &override_keys,
        input.host_manifest.overrides.allow_env_overrides,
        &input.host_manifest.overrides.allowed_env_keys,
    );
    for key in &blocked {
        warnings.push(ComposeWarning { kind: "override_blocked".to_string(), detail: key.clone() });
    }

    let well_known = WellKnownPlaceholders {
        nah_app_root: Some(input.app_record.paths.install_root.clone()),
        nah_app_entry: Some(safe_join(app_root, &input.app_manifest.app.execution.entrypoint).map(|p| p.to_string_lossy().to_string()).unwrap_or_default()),
        nah_app_id: Some(input.app_record.app.id.clone()),
        nah_app_version: Some(input.app_record.app.version.clone()),
        nah_nak_root: input.nak_record.map(|n| n.paths.root.clone()),
        nah_nak_resource_root: input.nak_record.and_then(|n| n.paths.resource_root.clone()),
    };
    env_algebra::inject_well_known(&mut folded, &well_known);
    if let Some(nak) = input.nak_record {
        folded.insert("NAH_NAK_ID".to_string(), Some(nak.id.clone()));
        folded.insert("NAH_NAK_VERSION".to_string(), Some(nak.version.clone()));
    }

    let environment = match env_algebra::resolve_environment(&folded, &well_known, input.process_env) {
        Ok(env) => env,
        Err(e) => {
            return ComposeOutcome { contract: None, warnings, trace: input.options.trace.then_some(trace), critical_error: Some(e) };
        }
    };
    record_step(&mut trace, "environment_fold", "fold NAK -> host -> app -> overrides, then substitute placeholders", serde_json::json!({ "keys": environment.iter().map(|(k, _)| k).collect::<Vec<_>>() }));

    // Step 5: binary + arguments.
    let override_prepend = &input.app_record.overrides.arguments.prepend;
    let override_append = &input.app_record.overrides.arguments.append;

    let (binary, arguments) = match input.nak_record.and_then(select_loader) {
        Some((_, loader)) => {
            let mut template_args = Vec::new();
            for arg in &loader.args_template {
                match env_algebra::substitute_placeholders(arg, &well_known, &folded, input.process_env) {
                    Ok(v) => template_args.push(v),
                    Err(e) => {
                        return ComposeOutcome { contract: None, warnings, trace: input.options.trace.then_some(trace), critical_error: Some(e) };
                    }
                }
            }
            let mut args = override_prepend.clone();
            args.extend(template_args);
            args.extend(input.app_manifest.app.execution.arguments.clone());
            args.extend(override_append.clone());
            (loader.exec_path.clone(), args)
        }
        None => {
            let binary = match safe_join(app_root, &input.app_manifest.app.execution.entrypoint) {
                Ok(p) => p.to_string_lossy().to_string(),
                Err(e) => {
                    return ComposeOutcome { contract: None, warnings, trace: input.options.trace.then_some(trace), critical_error: Some(e) };
                }
            };
            let mut args = override_prepend.clone();
            args.extend(input.app_manifest.app.execution.arguments.clone());
            args.extend(override_append.clone());
            (binary, args)
        }
    };
    record_step(&mut trace, "binary_selection", "select entrypoint or loader exec_path and assemble arguments", serde_json::json!({ "binary": binary, "arguments": arguments }));

    // Step 6: cwd.
    let cwd = match input.nak_record.and_then(|n| n.execution_cwd.as_deref()) {
        Some(template) => match env_algebra::substitute_placeholders(template, &well_known, &folded, input.process_env) {
            Ok(v) => v,
            Err(e) => {
                return ComposeOutcome { contract: None, warnings, trace: input.options.trace.then_some(trace), critical_error: Some(e) };
            }
        },
        None => input.app_record.paths.install_root.clone(),
    };
    record_step(&mut trace, "cwd", "resolve working directory", serde_json::json!({ "cwd": cwd }));

    let contract = LaunchContract {
        app: ContractApp {
            id: input.app_record.app.id.clone(),
            version: input.app_record.app.version.clone(),
            root: input.app_record.paths.install_root.clone(),
            entrypoint: input.app_manifest.app.execution.entrypoint.clone(),
        },
        nak: input.nak_record.map(|n| ContractNak { id: n.id.clone(), version: n.version.clone(), root: n.paths.root.clone() }),
        execution: ContractExecution { binary, cwd, arguments, library_path_env_key: path_env_key.to_string(), library_paths },
        environment,
        trust: ContractTrust { state: input.app_record.trust.state, source: input.app_record.trust.source.clone() },
    };

    ComposeOutcome { contract: Some(contract), warnings, trace: input.options.trace.then_some(trace), critical_error: None }
}
