//! Validated, ordered set of resource groups.

use super::spec::ResourceGroupSpec;
use crate::errors::{codes, ConfigurationError, ErrorInfo};
use crate::utils::validation::{detect_cycle, reachable_from};
use std::collections::{BTreeSet, HashMap};

/// A set of resource groups checked against each other and sorted into a
/// provisioning order.
///
/// The order is a topological sort of `depends_on`. Ties are broken by tier,
/// then by declaration order, so the same input always yields the same order.
#[derive(Debug, Clone)]
pub struct StackPlan {
    order: Vec<ResourceGroupSpec>,
    index: HashMap<String, usize>,
    producers: HashMap<String, String>,
}

impl StackPlan {
    /// Validates `specs` and computes the provisioning order.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for any per-group validation failure,
    /// a duplicate group id, an unknown dependency, a dependency on a later
    /// tier, a dependency cycle, two declarations claiming the same physical
    /// name, an export name declared by two groups, or an import that no
    /// transitive dependency exports.
    pub fn new(specs: Vec<ResourceGroupSpec>) -> Result<Self, ConfigurationError> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        for (pos, spec) in specs.iter().enumerate() {
            spec.validate()?;
            if positions.insert(spec.id.clone(), pos).is_some() {
                return Err(ConfigurationError::new(format!(
                    "Resource group '{}' is declared more than once",
                    spec.id
                ))
                .with_subjects(vec![spec.id.clone()])
                .with_info(ErrorInfo::new(codes::DUPLICATE, "Duplicate resource group")));
            }
        }

        for spec in &specs {
            for dep in &spec.depends_on {
                let Some(&dep_pos) = positions.get(dep) else {
                    return Err(ConfigurationError::new(format!(
                        "Resource group '{}' depends on undeclared group '{}'",
                        spec.id, dep
                    ))
                    .with_subjects(vec![spec.id.clone(), dep.clone()])
                    .with_info(ErrorInfo::new(codes::MISSING_REF, "Unknown dependency")));
                };
                let dep_tier = specs[dep_pos].tier;
                if dep_tier.rank() > spec.tier.rank() {
                    return Err(ConfigurationError::new(format!(
                        "Resource group '{}' ({}) cannot depend on '{}' ({}) from a later tier",
                        spec.id, spec.tier, dep, dep_tier
                    ))
                    .with_subjects(vec![spec.id.clone(), dep.clone()])
                    .with_info(
                        ErrorInfo::new(codes::TIER_ORDER, "Dependency on a later tier")
                            .with_fix_hint("Move the dependency into an earlier tier or drop it."),
                    ));
                }
            }
        }

        let graph: HashMap<String, Vec<String>> = specs
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect();
        let declared: Vec<String> = specs.iter().map(|s| s.id.clone()).collect();
        detect_cycle(&graph, &declared)?;

        check_physical_names(&specs)?;
        let producers = collect_exports(&specs)?;

        for spec in &specs {
            let upstream = reachable_from(&graph, &spec.id);
            for import in &spec.imports {
                match producers.get(import) {
                    None => {
                        return Err(ConfigurationError::new(format!(
                            "Resource group '{}' imports '{}' which no group exports",
                            spec.id, import
                        ))
                        .with_subjects(vec![spec.id.clone(), import.clone()])
                        .with_info(ErrorInfo::new(codes::MISSING_REF, "Unknown import")));
                    }
                    Some(producer) if !upstream.contains(producer) => {
                        return Err(ConfigurationError::new(format!(
                            "Resource group '{}' imports '{}' from '{}' without depending on it",
                            spec.id, import, producer
                        ))
                        .with_subjects(vec![spec.id.clone(), producer.clone()])
                        .with_info(
                            ErrorInfo::new(codes::MISSING_REF, "Import from a non-dependency")
                                .with_fix_hint(format!("Add '{producer}' to dependsOn.")),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        let order = ordered(specs, &positions);
        let index = order
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        Ok(Self {
            order,
            index,
            producers,
        })
    }

    /// Iterates groups in provisioning order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceGroupSpec> {
        self.order.iter()
    }

    /// Group ids in provisioning order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.order.iter().map(|s| s.id.clone()).collect()
    }

    /// Looks up a group by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceGroupSpec> {
        self.index.get(id).map(|&i| &self.order[i])
    }

    /// The group that exports `name`.
    #[must_use]
    pub fn producer_of(&self, export_name: &str) -> Option<&str> {
        self.producers.get(export_name).map(String::as_str)
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the plan has no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn check_physical_names(specs: &[ResourceGroupSpec]) -> Result<(), ConfigurationError> {
    let mut claimed: HashMap<(&str, &str), &str> = HashMap::new();
    for spec in specs {
        for resource in &spec.resources {
            let Some(name) = resource.physical_name() else {
                continue;
            };
            let key = (resource.resource_type.as_str(), name);
            if let Some(owner) = claimed.insert(key, spec.id.as_str()) {
                return Err(ConfigurationError::new(format!(
                    "{} '{}' is declared by both '{}' and '{}'",
                    resource.resource_type, name, owner, spec.id
                ))
                .with_subjects(vec![owner.to_string(), spec.id.clone()])
                .with_info(
                    ErrorInfo::new(codes::DUPLICATE, "Conflicting physical name")
                        .with_fix_hint("Declare the resource in exactly one group."),
                ));
            }
        }
    }
    Ok(())
}

fn collect_exports(specs: &[ResourceGroupSpec]) -> Result<HashMap<String, String>, ConfigurationError> {
    let mut producers: HashMap<String, String> = HashMap::new();
    for spec in specs {
        for export in &spec.exports {
            if let Some(other) = producers.insert(export.name.clone(), spec.id.clone()) {
                return Err(ConfigurationError::new(format!(
                    "Export '{}' is declared by both '{}' and '{}'",
                    export.name, other, spec.id
                ))
                .with_subjects(vec![other, spec.id.clone()])
                .with_info(ErrorInfo::new(codes::DUPLICATE, "Duplicate export name")));
            }
        }
    }
    Ok(producers)
}

/// Kahn's algorithm, picking the ready group with the lowest (tier, position).
fn ordered(specs: Vec<ResourceGroupSpec>, positions: &HashMap<String, usize>) -> Vec<ResourceGroupSpec> {
    let mut remaining: Vec<usize> = specs.iter().map(|s| s.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (pos, spec) in specs.iter().enumerate() {
        for dep in &spec.depends_on {
            if let Some(&dep_pos) = positions.get(dep) {
                dependents[dep_pos].push(pos);
            }
        }
    }

    let mut ready: BTreeSet<(u8, usize)> = specs
        .iter()
        .enumerate()
        .filter(|(pos, _)| remaining[*pos] == 0)
        .map(|(pos, s)| (s.tier.rank(), pos))
        .collect();

    let mut sequence = Vec::with_capacity(specs.len());
    while let Some(next) = ready.pop_first() {
        let pos = next.1;
        sequence.push(pos);
        for &dependent in &dependents[pos] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert((specs[dependent].tier.rank(), dependent));
            }
        }
    }

    let mut slots: Vec<Option<ResourceGroupSpec>> = specs.into_iter().map(Some).collect();
    sequence
        .into_iter()
        .filter_map(|pos| slots[pos].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::spec::{ResourceDeclaration, StackTier};
    use pretty_assertions::assert_eq;

    fn group(id: &str, tier: StackTier) -> ResourceGroupSpec {
        ResourceGroupSpec::new(id, tier)
    }

    fn pipeline_groups() -> Vec<ResourceGroupSpec> {
        vec![
            group("orchestration", StackTier::Orchestration)
                .depends_on("storage")
                .depends_on("etl")
                .with_import("IngestBucketName"),
            group("etl", StackTier::DataMovement).depends_on("network"),
            group("storage", StackTier::Storage)
                .with_resource(
                    ResourceDeclaration::new("IngestBucket", "bucket")
                        .with_property("name", serde_json::json!("ingest")),
                )
                .with_export("IngestBucketName", "IngestBucket", "id"),
            group("network", StackTier::Network),
        ]
    }

    #[test]
    fn test_order_respects_dependencies_and_tiers() {
        let plan = StackPlan::new(pipeline_groups()).unwrap();
        assert_eq!(plan.ids(), vec!["network", "storage", "etl", "orchestration"]);
        assert_eq!(plan.producer_of("IngestBucketName"), Some("storage"));
        assert_eq!(plan.get("etl").map(|s| s.tier), Some(StackTier::DataMovement));
    }

    #[test]
    fn test_order_is_deterministic_for_independent_groups() {
        let specs = vec![
            group("b", StackTier::Compute),
            group("a", StackTier::Compute),
            group("net", StackTier::Network),
        ];
        let plan = StackPlan::new(specs).unwrap();
        assert_eq!(plan.ids(), vec!["net", "b", "a"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let specs = vec![
            group("a", StackTier::Compute).depends_on("b"),
            group("b", StackTier::Compute).depends_on("a"),
        ];
        let err = StackPlan::new(specs).unwrap_err();
        assert_eq!(err.code(), Some(codes::CYCLE));
        assert_eq!(err.subjects, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let specs = vec![group("a", StackTier::Compute).depends_on("ghost")];
        assert_eq!(StackPlan::new(specs).unwrap_err().code(), Some(codes::MISSING_REF));
    }

    #[test]
    fn test_dependency_on_later_tier_rejected() {
        let specs = vec![
            group("net", StackTier::Network).depends_on("db"),
            group("db", StackTier::Storage),
        ];
        assert_eq!(StackPlan::new(specs).unwrap_err().code(), Some(codes::TIER_ORDER));
    }

    #[test]
    fn test_duplicate_group_rejected() {
        let specs = vec![group("a", StackTier::Compute), group("a", StackTier::Storage)];
        assert_eq!(StackPlan::new(specs).unwrap_err().code(), Some(codes::DUPLICATE));
    }

    #[test]
    fn test_conflicting_physical_names_rejected() {
        let policy = |id: &str| {
            ResourceDeclaration::new(id, "bucket_policy").with_property("name", serde_json::json!("ingest"))
        };
        let specs = vec![
            group("storage", StackTier::Storage).with_resource(policy("Policy")),
            group("etl", StackTier::DataMovement)
                .depends_on("storage")
                .with_resource(policy("OtherPolicy")),
        ];
        let err = StackPlan::new(specs).unwrap_err();
        assert_eq!(err.code(), Some(codes::DUPLICATE));
        assert!(err.message.contains("bucket_policy 'ingest'"));
    }

    #[test]
    fn test_import_requires_dependency() {
        let mut specs = pipeline_groups();
        specs[0].depends_on.retain(|d| d != "storage");
        let err = StackPlan::new(specs).unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_REF));
        assert!(err.message.contains("without depending"));
    }

    #[test]
    fn test_transitive_import_accepted() {
        let specs = vec![
            group("storage", StackTier::Storage)
                .with_resource(ResourceDeclaration::new("Bucket", "bucket"))
                .with_export("BucketName", "Bucket", "id"),
            group("etl", StackTier::DataMovement).depends_on("storage"),
            group("orchestration", StackTier::Orchestration)
                .depends_on("etl")
                .with_import("BucketName"),
        ];
        assert!(StackPlan::new(specs).is_ok());
    }

    #[test]
    fn test_unknown_import_rejected() {
        let specs = vec![group("a", StackTier::Compute).with_import("Nothing")];
        assert!(StackPlan::new(specs).is_err());
    }
}
