use serde::{Deserialize, Serialize};

use crate::LaunchRequest;

/// Most instance types listed in an "unknown type" message.
const MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub description: String,
    pub price_cents_per_hour: u64,
    pub regions_available: Vec<String>,
}

impl InstanceType {
    pub fn price_per_hour(&self) -> f64 {
        self.price_cents_per_hour as f64 / 100.0
    }

    pub fn estimate_cost(&self, hours: u32) -> f64 {
        self.price_per_hour() * f64::from(hours)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystem {
    pub id: String,
    pub name: String,
    pub region: String,
    pub mount_point: String,
    pub is_in_use: bool,
}

/// What the provider currently offers. A part is `None` when it could not be
/// fetched; checks against it then degrade to a warning.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub instance_types: Option<Vec<InstanceType>>,
    pub ssh_keys: Option<Vec<String>>,
    pub file_systems: Option<Vec<FileSystem>>,
}

/// Outcome of checking a launch request before anything is billed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchCheck {
    /// Launching would fail. Each entry is a message with a suggestion.
    pub errors: Vec<String>,
    /// Launching may fail or wait for capacity.
    pub warnings: Vec<String>,
}

impl LaunchCheck {
    pub fn can_launch(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Catalog {
    pub fn instance_type(&self, name: &str) -> Option<&InstanceType> {
        self.instance_types.as_ref()?.iter().find(|t| t.name == name)
    }

    pub fn check(&self, request: &LaunchRequest) -> LaunchCheck {
        let mut check = LaunchCheck::default();
        let region = request.region_name.as_str();

        if request.ssh_key_names.is_empty() {
            check
                .errors
                .push("no SSH keys given; at least one is required for access".to_string());
        }

        match &self.instance_types {
            None => check
                .warnings
                .push("could not verify the instance type; launch may fail".to_string()),
            Some(types) => match types.iter().find(|t| t.name == request.instance_type_name) {
                None => {
                    let mut names: Vec<&str> = types
                        .iter()
                        .filter(|t| !t.regions_available.is_empty())
                        .map(|t| t.name.as_str())
                        .collect();
                    names.sort_unstable();
                    names.truncate(MAX_SUGGESTIONS);
                    let available = if names.is_empty() {
                        "none with capacity".to_string()
                    } else {
                        names.join(", ")
                    };
                    check.errors.push(format!(
                        "instance type '{}' not found (available: {})",
                        request.instance_type_name, available
                    ));
                }
                Some(t) if t.regions_available.is_empty() => check.warnings.push(format!(
                    "no current capacity for '{}' in any region",
                    t.name
                )),
                Some(t) if !t.regions_available.iter().any(|r| r == region) => {
                    check.warnings.push(format!(
                        "no capacity for '{}' in '{}' (available in: {})",
                        t.name,
                        region,
                        t.regions_available.join(", ")
                    ))
                }
                Some(_) => {}
            },
        }

        if !request.file_system_names.is_empty() {
            match &self.file_systems {
                None => check
                    .warnings
                    .push("could not verify filesystems; launch may fail".to_string()),
                Some(file_systems) => {
                    for name in &request.file_system_names {
                        match file_systems.iter().find(|fs| &fs.name == name) {
                            None => {
                                let known: Vec<&str> =
                                    file_systems.iter().map(|fs| fs.name.as_str()).collect();
                                check.errors.push(format!(
                                    "filesystem '{}' not found (available: {})",
                                    name,
                                    if known.is_empty() { "none".to_string() } else { known.join(", ") }
                                ));
                            }
                            Some(fs) if fs.region != region => check.errors.push(format!(
                                "filesystem '{}' is in '{}', not '{}'; use --region {} or create it in {}",
                                name, fs.region, region, fs.region, region
                            )),
                            Some(_) => {}
                        }
                    }
                }
            }
        }

        match &self.ssh_keys {
            None => check
                .warnings
                .push("could not verify SSH keys; launch may fail".to_string()),
            Some(keys) => {
                for key in &request.ssh_key_names {
                    if !keys.contains(key) {
                        check.errors.push(format!("SSH key '{}' not found", key));
                    }
                }
            }
        }

        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog {
            instance_types: Some(vec![
                InstanceType {
                    name: "gpu_1x_a10".into(),
                    description: "1x A10".into(),
                    price_cents_per_hour: 75,
                    regions_available: vec!["us-east-1".into()],
                },
                InstanceType {
                    name: "gpu_8x_h100".into(),
                    description: "8x H100".into(),
                    price_cents_per_hour: 2392,
                    regions_available: vec![],
                },
            ]),
            ssh_keys: Some(vec!["laptop".into()]),
            file_systems: Some(vec![FileSystem {
                id: "fs-1".into(),
                name: "gpulease".into(),
                region: "us-east-1".into(),
                mount_point: "/lambda/nfs/gpulease".into(),
                is_in_use: false,
            }]),
        }
    }

    fn request(instance_type: &str, region: &str) -> LaunchRequest {
        LaunchRequest {
            region_name: region.into(),
            instance_type_name: instance_type.into(),
            ssh_key_names: vec!["laptop".into()],
            file_system_names: vec!["gpulease".into()],
            name: None,
        }
    }

    #[test]
    fn valid_request_passes() {
        let check = catalog().check(&request("gpu_1x_a10", "us-east-1"));
        assert_eq!(check, LaunchCheck::default());
        assert!(check.can_launch());
    }

    #[test]
    fn unknown_type_lists_types_with_capacity() {
        let check = catalog().check(&request("gpu_1x_b200", "us-east-1"));
        assert!(!check.can_launch());
        assert_eq!(
            check.errors,
            vec!["instance type 'gpu_1x_b200' not found (available: gpu_1x_a10)".to_string()]
        );
    }

    #[test]
    fn missing_capacity_only_warns() {
        let check = catalog().check(&request("gpu_8x_h100", "us-east-1"));
        assert!(check.can_launch());
        assert_eq!(check.warnings.len(), 1);
    }

    #[test]
    fn filesystem_in_other_region_blocks_launch() {
        let mut req = request("gpu_1x_a10", "us-west-1");
        req.ssh_key_names.push("desktop".into());
        let check = catalog().check(&req);
        assert_eq!(check.errors.len(), 2);
        assert!(check.errors[0].contains("is in 'us-east-1', not 'us-west-1'"));
        assert_eq!(check.errors[1], "SSH key 'desktop' not found");
        assert!(check.warnings[0].contains("available in: us-east-1"));
    }

    #[test]
    fn unknown_parts_degrade_to_warnings() {
        let check = Catalog::default().check(&request("gpu_1x_a10", "us-east-1"));
        assert!(check.can_launch());
        assert_eq!(check.warnings.len(), 3);
    }

    #[test]
    fn cost_estimate() {
        let catalog = catalog();
        let a10 = catalog.instance_type("gpu_1x_a10").unwrap();
        assert!((a10.estimate_cost(4) - 3.0).abs() < 1e-9);
    }
}
