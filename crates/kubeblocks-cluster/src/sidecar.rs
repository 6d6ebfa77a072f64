//! Sidecar attachment
//!
//! A SidecarDefinition is owned by some ComponentDefinitions and injected into
//! components of other ComponentDefinitions. It applies to a component when
//! the cluster runs one of its owners and the component's definition is one
//! of its selectors.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;

use kubeblocks_common::constants::split_list;
use kubeblocks_common::crd::{Available, Component, Sidecar, SidecarDefinition};
use kubeblocks_common::{Error, Result};

/// A sidecar definition applicable to a component, with the owners present in the cluster
#[derive(Clone, Debug)]
pub struct SidecarCandidate<'a> {
    /// The definition
    pub definition: &'a SidecarDefinition,
    /// Owning ComponentDefinitions used by the cluster, sorted descending
    pub owners: Vec<String>,
}

fn status_set(value: Option<&String>) -> BTreeSet<String> {
    value.map(|v| split_list(v)).unwrap_or_default().into_iter().collect()
}

/// Candidates per sidecar name for a component of `comp_def`
///
/// `cluster_comp_defs` are the ComponentDefinitions used anywhere in the
/// cluster. Candidates of each sidecar name are ordered by definition name
/// descending, so the first is the latest.
pub fn hosted_sidecars<'a>(
    definitions: &'a [SidecarDefinition],
    cluster_comp_defs: &BTreeSet<String>,
    comp_def: &str,
) -> Result<BTreeMap<String, Vec<SidecarCandidate<'a>>>> {
    let mut result: BTreeMap<String, Vec<SidecarCandidate<'a>>> = BTreeMap::new();

    for def in definitions {
        let status = def.status.as_ref();
        let owners = status_set(status.and_then(|s| s.owners.as_ref()));
        let selectors = status_set(status.and_then(|s| s.selectors.as_ref()));

        let owned: BTreeSet<String> = cluster_comp_defs.intersection(&owners).cloned().collect();
        if owned.is_empty() {
            continue;
        }
        let selected: BTreeSet<String> = cluster_comp_defs
            .intersection(&selectors)
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(Error::resolution(format!(
                "no comp-def selected by sidecar definition: {}",
                def.name_any()
            )));
        }
        let overlapped: Vec<String> = selected.intersection(&owned).cloned().collect();
        if !overlapped.is_empty() {
            return Err(Error::resolution(format!(
                "owner and selectors should not be overlapped: {}",
                overlapped.join(",")
            )));
        }
        if !selected.contains(comp_def) {
            continue;
        }

        let mut owner_list: Vec<String> = owned.into_iter().collect();
        owner_list.reverse();
        result
            .entry(def.spec.name.clone())
            .or_default()
            .push(SidecarCandidate {
                definition: def,
                owners: owner_list,
            });
    }

    for candidates in result.values_mut() {
        candidates.sort_by(|a, b| b.definition.name_any().cmp(&a.definition.name_any()));
    }
    Ok(result)
}

fn checked(sidecar: Sidecar, def: &SidecarDefinition) -> Result<Sidecar> {
    if !def.is_available() {
        return Err(Error::resolution(format!(
            "the SidecarDefinition is not up to date or unavailable: {}",
            def.name_any()
        )));
    }
    Ok(sidecar)
}

/// Pick the binding for one sidecar name
///
/// The running binding is kept while its definition and owner are still
/// candidates; otherwise the latest candidate is used.
pub fn choose_sidecar(
    name: &str,
    candidates: &[SidecarCandidate<'_>],
    running: Option<&Component>,
) -> Result<Sidecar> {
    if let Some(current) = running.and_then(|r| r.spec.sidecars.iter().find(|s| s.name == name)) {
        for candidate in candidates {
            if current.sidecar_def == candidate.definition.name_any()
                && candidate.owners.contains(&current.owner)
            {
                return checked(current.clone(), candidate.definition);
            }
        }
    }

    let latest = candidates
        .first()
        .ok_or_else(|| Error::impossible(format!("no sidecar definition candidates for {}", name)))?;
    let owner = latest
        .owners
        .first()
        .cloned()
        .ok_or_else(|| Error::impossible(format!("sidecar {} has no owner", name)))?;
    checked(
        Sidecar {
            name: latest.definition.spec.name.clone(),
            owner,
            sidecar_def: latest.definition.name_any(),
        },
        latest.definition,
    )
}

/// Resolve the sorted sidecars of a component
pub fn resolve_sidecars(
    definitions: &[SidecarDefinition],
    cluster_comp_defs: &BTreeSet<String>,
    comp_def: &str,
    running: Option<&Component>,
) -> Result<Vec<Sidecar>> {
    let hosted = hosted_sidecars(definitions, cluster_comp_defs, comp_def)?;
    let mut sidecars = hosted
        .iter()
        .map(|(name, candidates)| choose_sidecar(name, candidates, running))
        .collect::<Result<Vec<_>>>()?;
    sidecars.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sidecars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubeblocks_common::crd::{
        ComponentSpec, DefinitionPhase, SidecarDefinitionSpec, SidecarDefinitionStatus,
    };

    fn sidecar_def(def_name: &str, sidecar: &str, owners: &str, selectors: &str) -> SidecarDefinition {
        let mut def = SidecarDefinition::new(
            def_name,
            SidecarDefinitionSpec {
                name: sidecar.to_string(),
                owner: owners.to_string(),
                ..Default::default()
            },
        );
        def.metadata.generation = Some(1);
        def.status = Some(SidecarDefinitionStatus {
            observed_generation: Some(1),
            phase: DefinitionPhase::Available,
            owners: Some(owners.to_string()),
            selectors: Some(selectors.to_string()),
        });
        def
    }

    fn comp_defs(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_not_owned_is_ignored() {
        let defs = vec![sidecar_def("exporter-1", "exporter", "proxy", "mysql")];
        let sidecars = resolve_sidecars(&defs, &comp_defs(&["mysql"]), "mysql", None).unwrap();
        assert!(sidecars.is_empty());
    }

    #[test]
    fn test_attached_to_selected_component_only() {
        let defs = vec![sidecar_def("exporter-1", "exporter", "proxy", "mysql")];
        let cluster = comp_defs(&["mysql", "proxy"]);

        let sidecars = resolve_sidecars(&defs, &cluster, "mysql", None).unwrap();
        assert_eq!(
            sidecars,
            vec![Sidecar {
                name: "exporter".to_string(),
                owner: "proxy".to_string(),
                sidecar_def: "exporter-1".to_string(),
            }]
        );
        assert!(resolve_sidecars(&defs, &cluster, "proxy", None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_overlapping_owner_and_selector_rejected() {
        let defs = vec![sidecar_def("exporter-1", "exporter", "mysql", "mysql")];
        let err = resolve_sidecars(&defs, &comp_defs(&["mysql"]), "mysql", None).unwrap_err();
        assert!(err.to_string().contains("should not be overlapped"));
    }

    #[test]
    fn test_owned_but_nothing_selected_rejected() {
        let defs = vec![sidecar_def("exporter-1", "exporter", "proxy", "redis")];
        let err =
            resolve_sidecars(&defs, &comp_defs(&["mysql", "proxy"]), "mysql", None).unwrap_err();
        assert!(err.to_string().contains("no comp-def selected"));
    }

    #[test]
    fn test_latest_definition_wins_unless_running_binding_valid() {
        let defs = vec![
            sidecar_def("exporter-1", "exporter", "proxy", "mysql"),
            sidecar_def("exporter-2", "exporter", "proxy", "mysql"),
        ];
        let cluster = comp_defs(&["mysql", "proxy"]);

        let fresh = resolve_sidecars(&defs, &cluster, "mysql", None).unwrap();
        assert_eq!(fresh[0].sidecar_def, "exporter-2");

        let running = Component::new(
            "c-mysql",
            ComponentSpec {
                sidecars: vec![Sidecar {
                    name: "exporter".to_string(),
                    owner: "proxy".to_string(),
                    sidecar_def: "exporter-1".to_string(),
                }],
                ..Default::default()
            },
        );
        let kept = resolve_sidecars(&defs, &cluster, "mysql", Some(&running)).unwrap();
        assert_eq!(kept[0].sidecar_def, "exporter-1");
    }

    #[test]
    fn test_unavailable_definition_rejected() {
        let mut def = sidecar_def("exporter-1", "exporter", "proxy", "mysql");
        def.metadata.generation = Some(2);
        let err = resolve_sidecars(&[def], &comp_defs(&["mysql", "proxy"]), "mysql", None)
            .unwrap_err();
        assert!(err.to_string().contains("exporter-1"));
    }

    #[test]
    fn test_sidecars_sorted_by_name() {
        let defs = vec![
            sidecar_def("b-1", "zeta", "proxy", "mysql"),
            sidecar_def("a-1", "alpha", "proxy", "mysql"),
        ];
        let sidecars =
            resolve_sidecars(&defs, &comp_defs(&["mysql", "proxy"]), "mysql", None).unwrap();
        let names: Vec<&str> = sidecars.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
