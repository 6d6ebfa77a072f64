//! Account secrets shared by every shard of a sharding
//!
//! A ShardingDefinition may flag system accounts as shared: all shards then
//! use one credential, kept in a secret owned by the cluster. The secret is
//! created once and never rewritten.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::Resource;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use kubeblocks_common::constants::{
    RESTORE_FROM_BACKUP_ANNOTATION, SHARDING_NAME_LABEL, SYSTEM_ACCOUNT_LABEL,
};
use kubeblocks_common::crd::{Cluster, LetterCase, PasswordConfig};
use kubeblocks_common::{Error, Result};

use super::Transformer;
use crate::builder::cluster_labels;
use crate::context::TransformContext;
use crate::dag::{ClusterObject, Verb};

const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"~!@#$%^&*()_+-={}|[]:<>?,./";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Key of the restore source entry holding account passwords
const RESTORED_ACCOUNTS_KEY: &str = "encryptedSystemAccounts";

/// Creates the shared account secrets of every sharding
pub struct SharedAccountTransformer;

/// Name of the secret holding a shared account of a sharding
pub fn shared_account_secret_name(cluster: &str, sharding: &str, account: &str) -> String {
    format!("{}-{}-{}", cluster, sharding, account)
}

fn pick(set: &[u8], n: usize, rng: &mut impl Rng) -> Vec<u8> {
    (0..n).map(|_| set[rng.gen_range(0..set.len())]).collect()
}

/// Generate a password following the account's policy
pub fn generate_password(config: &PasswordConfig, rng: &mut impl Rng) -> Result<String> {
    let length = usize::try_from(config.length).unwrap_or(0);
    let digits = usize::try_from(config.num_digits).unwrap_or(0);
    let symbols = usize::try_from(config.num_symbols).unwrap_or(0);
    if length == 0 || digits + symbols > length {
        return Err(Error::validation(format!(
            "invalid password policy: length {}, digits {}, symbols {}",
            config.length, config.num_digits, config.num_symbols
        )));
    }

    let mut chars = pick(DIGITS, digits, rng);
    chars.extend(pick(SYMBOLS, symbols, rng));
    chars.extend(pick(LETTERS, length - digits - symbols, rng));
    chars.shuffle(rng);

    let password: String = chars.into_iter().map(char::from).collect();
    Ok(match config.letter_case {
        LetterCase::UpperCases => password.to_uppercase(),
        LetterCase::LowerCases => password.to_lowercase(),
        LetterCase::MixedCases => password,
    })
}

/// Password of `account` recorded for `sharding` in the restore annotation
///
/// The sharding's entry may carry account passwords, either as an object or
/// as a JSON-encoded string, under `encryptedSystemAccounts`.
fn restored_password(cluster: &Cluster, sharding: &str, account: &str) -> Result<Option<String>> {
    let Some(raw) = cluster.annotation(RESTORE_FROM_BACKUP_ANNOTATION) else {
        return Ok(None);
    };
    let invalid = |e: serde_json::Error| {
        Error::serialization_for_kind(
            "Cluster",
            format!("invalid {} annotation: {}", RESTORE_FROM_BACKUP_ANNOTATION, e),
        )
    };
    let sources: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw).map_err(invalid)?;
    let Some(accounts) = sources.get(sharding).and_then(|s| s.get(RESTORED_ACCOUNTS_KEY)) else {
        return Ok(None);
    };
    let accounts: BTreeMap<String, String> = match accounts {
        serde_json::Value::String(encoded) => serde_json::from_str(encoded).map_err(invalid)?,
        other => serde_json::from_value(other.clone()).map_err(invalid)?,
    };
    Ok(accounts.get(account).cloned())
}

fn account_secret(cluster: &Cluster, sharding: &str, account: &str, password: String) -> Secret {
    let cluster_name = cluster.metadata.name.clone().unwrap_or_default();
    let mut labels = cluster_labels(&cluster_name);
    labels.insert(SHARDING_NAME_LABEL.to_string(), sharding.to_string());
    labels.insert(SYSTEM_ACCOUNT_LABEL.to_string(), account.to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(shared_account_secret_name(&cluster_name, sharding, account)),
            namespace: cluster.metadata.namespace.clone(),
            labels: Some(labels),
            owner_references: cluster.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        immutable: Some(true),
        data: Some(BTreeMap::from([
            ("username".to_string(), ByteString(account.as_bytes().to_vec())),
            ("password".to_string(), ByteString(password.into_bytes())),
        ])),
        ..Default::default()
    }
}

#[async_trait]
impl Transformer for SharedAccountTransformer {
    fn name(&self) -> &'static str {
        "shared-account"
    }

    async fn transform(&self, ctx: &mut TransformContext) -> Result<()> {
        if ctx.orig_cluster.is_deleting() {
            return Ok(());
        }
        let cluster_name = ctx.cluster_name();
        let namespace = ctx.namespace();

        for sharding in ctx.shardings.clone() {
            let Some(def) = ctx.sharding_defs.get(&sharding.sharding_def).cloned() else {
                continue;
            };
            for account in def.spec.system_accounts.iter().filter(|a| a.shared == Some(true)) {
                let name = shared_account_secret_name(&cluster_name, &sharding.name, &account.name);
                if ctx.store.get_secret(&namespace, &name).await?.is_some() {
                    continue;
                }

                let comp_def = &sharding.template.component_def;
                let policy = ctx
                    .component_defs
                    .get(comp_def)
                    .and_then(|d| d.spec.system_accounts.iter().find(|a| a.name == account.name))
                    .map(|a| a.password_generation_policy.clone())
                    .ok_or_else(|| {
                        Error::validation_for(
                            &cluster_name,
                            format!(
                                "shared account {} of sharding {} is not defined by ComponentDefinition {}",
                                account.name, sharding.name, comp_def
                            ),
                        )
                    })?;

                let password = match restored_password(&ctx.cluster, &sharding.name, &account.name)? {
                    Some(password) => password,
                    None => generate_password(&policy, &mut ctx.rng)?,
                };
                info!(cluster = %cluster_name, sharding = %sharding.name, account = %account.name, "creating shared account secret");
                let secret = account_secret(&ctx.cluster, &sharding.name, &account.name, password);
                ctx.graph
                    .add(Verb::Create, ClusterObject::Secret(Box::new(secret)));
            }
        }
        Ok(())
    }
}
