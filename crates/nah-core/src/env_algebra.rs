//! Environment algebra (§4.H): fold layered `set/prepend/append/unset`
//! operations into an ordered `(key, value)` map, then substitute
//! `{PLACEHOLDER}` tokens in dependency order. The fold builds a map
//! before handing it to the child process, the same PATH-prepend shape
//! as a plain `Command::envs` call, generalized into a full layered
//! fold across NAK/host/app/override layers. `BTreeMap` (same
//! container the manifest types already use for `environment`) keeps
//! fold output in the deterministic key order the manifests are parsed
//! into.

use std::collections::BTreeMap;

use crate::error::{ErrorKind, NahError, Result};
use crate::manifest::env_value::{EnvOp, EnvValue};

/// Folds NAK → host → app/overrides layers (in that order) into an
/// ordered map of resolved (unsubstituted) values, starting from an
/// empty accumulator. A later layer's operation for a key always
/// applies after the earlier layers'.
pub fn fold_layers(layers: &[&BTreeMap<String, EnvValue>]) -> Result<BTreeMap<String, Option<String>>> {
    fold_layers_from(BTreeMap::new(), layers)
}

/// Same fold as `fold_layers`, but seeded from `base` (the inherited
/// process environment, for contracts that must carry the full child
/// environment rather than just the operated-on keys — see the §8
/// scenario 3 `PATH` chain, where the process's pre-existing `PATH`
/// value is the innermost value a chain of `prepend`s builds onto).
pub fn fold_layers_from(
    base: BTreeMap<String, Option<String>>,
    layers: &[&BTreeMap<String, EnvValue>],
) -> Result<BTreeMap<String, Option<String>>> {
    let mut acc = base;
    for layer in layers {
        for (key, raw) in layer.iter() {
            let op = raw.validate(key)?;
            fold_one(&mut acc, key, &op.op, op.value.as_deref(), &op.separator);
        }
    }
    Ok(acc)
}

/// Builds a fold base from the inherited process environment: every
/// entry becomes an implicit `set`, so later `prepend`/`append` ops see
/// it as the existing value to build onto.
pub fn process_env_base(process_env: &BTreeMap<String, String>) -> BTreeMap<String, Option<String>> {
    process_env.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect()
}

fn fold_one(acc: &mut BTreeMap<String, Option<String>>, key: &str, op: &EnvOp, value: Option<&str>, separator: &str) {
    match op {
        EnvOp::Set => {
            acc.insert(key.to_string(), value.map(str::to_string));
        }
        EnvOp::Prepend => {
            let value = value.unwrap_or_default();
            match acc.get(key) {
                None | Some(None) => {
                    acc.insert(key.to_string(), Some(value.to_string()));
                }
                Some(Some(existing)) => {
                    let combined = format!("{}{}{}", value, separator, existing);
                    acc.insert(key.to_string(), Some(combined));
                }
            }
        }
        EnvOp::Append => {
            let value = value.unwrap_or_default();
            match acc.get(key) {
                None | Some(None) => {
                    acc.insert(key.to_string(), Some(value.to_string()));
                }
                Some(Some(existing)) => {
                    let combined = format!("{}{}{}", existing, separator, value);
                    acc.insert(key.to_string(), Some(combined));
                }
            }
        }
        EnvOp::Unset => {
            acc.remove(key);
        }
    }
}

/// Well-known placeholders resolvable independent of the folded
/// environment (§4.H).
#[derive(Debug, Clone, Default)]
pub struct WellKnownPlaceholders {
    pub nah_app_root: Option<String>,
    pub nah_app_entry: Option<String>,
    pub nah_app_id: Option<String>,
    pub nah_app_version: Option<String>,
    pub nah_nak_root: Option<String>,
    pub nah_nak_resource_root: Option<String>,
}

impl WellKnownPlaceholders {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "NAH_APP_ROOT" => self.nah_app_root.as_deref(),
            "NAH_APP_ENTRY" => self.nah_app_entry.as_deref(),
            "NAH_APP_ID" => self.nah_app_id.as_deref(),
            "NAH_APP_VERSION" => self.nah_app_version.as_deref(),
            "NAH_NAK_ROOT" => self.nah_nak_root.as_deref(),
            "NAH_NAK_RESOURCE_ROOT" => self.nah_nak_resource_root.as_deref(),
            _ => None,
        }
    }
}

/// Substitutes every `{TOKEN}` in `template` using well-known
/// placeholders first, then previously-resolved entries of `resolved`,
/// then the inherited process environment (`process_env`), in
/// dependency order. Fails with `unknown_placeholder` if a token names
/// none of those, or `env_cycle` if resolving it would require itself.
pub fn substitute_placeholders(
    template: &str,
    well_known: &WellKnownPlaceholders,
    resolved: &BTreeMap<String, Option<String>>,
    process_env: &BTreeMap<String, String>,
) -> Result<String> {
    substitute_inner(template, well_known, resolved, process_env, &mut Vec::new())
}

fn substitute_inner(
    template: &str,
    well_known: &WellKnownPlaceholders,
    resolved: &BTreeMap<String, Option<String>>,
    process_env: &BTreeMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<String> {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            NahError::new(ErrorKind::UnknownPlaceholder, "substitute_placeholders", "unterminated placeholder")
                .with_details(serde_json::json!({ "template": template }))
        })?;
        let token = &after[..end];
        rest = &after[end + 1..];

        if stack.iter().any(|t| t == token) {
            return Err(NahError::new(ErrorKind::EnvCycle, "substitute_placeholders", "placeholder cycle detected")
                .with_details(serde_json::json!({ "token": token, "chain": stack })));
        }

        let value = resolve_token(token, well_known, resolved, process_env, stack)?;
        out.push_str(&value);
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve_token(
    token: &str,
    well_known: &WellKnownPlaceholders,
    resolved: &BTreeMap<String, Option<String>>,
    process_env: &BTreeMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<String> {
    if let Some(v) = well_known.lookup(token) {
        return Ok(v.to_string());
    }
    if let Some(Some(v)) = resolved.get(token) {
        stack.push(token.to_string());
        let expanded = substitute_inner(v, well_known, resolved, process_env, stack)?;
        stack.pop();
        return Ok(expanded);
    }
    if let Some(v) = process_env.get(token) {
        return Ok(v.clone());
    }
    Err(NahError::new(ErrorKind::UnknownPlaceholder, "substitute_placeholders", "unknown placeholder")
        .with_details(serde_json::json!({ "token": token })))
}

/// Substitutes placeholders in every value of a folded environment,
/// pushing each key onto the cycle-detection stack before expanding its
/// own value so a key referencing itself is also caught. Returns the
/// final ordered `(key, value)` list the contract carries (§3 "no
/// unresolved ops, no placeholders").
pub fn resolve_environment(
    folded: &BTreeMap<String, Option<String>>,
    well_known: &WellKnownPlaceholders,
    process_env: &BTreeMap<String, String>,
) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for (key, value) in folded {
        let Some(raw) = value else { continue };
        let mut stack = vec![key.clone()];
        let resolved = substitute_inner(raw, well_known, folded, process_env, &mut stack)?;
        out.push((key.clone(), resolved));
    }
    Ok(out)
}

/// Injects the six non-overridable `NAH_*` keys, overwriting whatever a
/// layer set for them (§4.H "not overridable").
pub fn inject_well_known(resolved: &mut BTreeMap<String, Option<String>>, well_known: &WellKnownPlaceholders) {
    let pairs = [
        ("NAH_APP_ROOT", &well_known.nah_app_root),
        ("NAH_APP_ENTRY", &well_known.nah_app_entry),
        ("NAH_APP_ID", &well_known.nah_app_id),
        ("NAH_APP_VERSION", &well_known.nah_app_version),
        ("NAH_NAK_ROOT", &well_known.nah_nak_root),
        ("NAH_NAK_RESOURCE_ROOT", &well_known.nah_nak_resource_root),
    ];
    for (key, value) in pairs {
        if let Some(v) = value {
            resolved.insert(key.to_string(), Some(v.clone()));
        }
    }
}

/// Enforces the host's overrides policy (§4.H): overrides are honored
/// only when `allow_env_overrides` is true, and if `allowed_env_keys`
/// is non-empty it further narrows that to an allow-list. Returns the
/// keys that were blocked (for `override_blocked` warnings) and leaves
/// `resolved` at the pre-app-layer value for each blocked key.
pub fn enforce_override_policy(
    resolved: &mut BTreeMap<String, Option<String>>,
    pre_app_layer: &BTreeMap<String, Option<String>>,
    app_keys: &[String],
    allow_env_overrides: bool,
    allowed_env_keys: &[String],
) -> Vec<String> {
    let mut blocked = Vec::new();
    for key in app_keys {
        let permitted = allow_env_overrides && (allowed_env_keys.is_empty() || allowed_env_keys.iter().any(|k| k == key));
        if permitted {
            continue;
        }
        match pre_app_layer.get(key) {
            Some(value) => {
                resolved.insert(key.clone(), value.clone());
            }
            None => {
                resolved.remove(key);
            }
        }
        blocked.push(key.clone());
    }
    blocked
}
