use super::StackDocument;
use anyhow::{Context, Result};
use std::path::Path;

pub fn load_from_path(path: &Path) -> Result<StackDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading stack document {}", path.display()))?;
    parse_document(&raw).with_context(|| format!("parsing stack document {}", path.display()))
}

pub fn parse_document(raw: &str) -> Result<StackDocument> {
    let doc: StackDocument = serde_yaml::from_str(raw)?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ResourceSpec;
    use crate::cluster::ConflictPolicy;

    const STACK: &str = r#"
label:
  namespace: eg
  name: eks
  stage: test
  tags:
    Team: platform
resources:
  - id: vpc
    kind: network
    cidr_block: 172.16.0.0/16
  - id: subnets
    kind: subnets
    availability_zones: [us-east-2a, us-east-2b, us-east-2c]
  - id: workers
    kind: node_group
    instance_types: [t3.medium]
    min_size: 1
    desired_size: 3
    max_size: 3
  - id: eks
    kind: cluster
    kubernetes_version: "1.30"
    addons:
      - name: vpc-cni
        version: v1.18.1-eksbuild.1
        resolve_conflicts_on_create: OVERWRITE
    depends_on: [vpc]
"#;

    #[test]
    fn test_parses_stack() {
        let doc = parse_document(STACK).unwrap();
        assert_eq!(doc.region, "us-east-2");
        assert_eq!(doc.label.delimiter, "-");
        assert_eq!(doc.resources.len(), 4);
        match &doc.resources[1].spec {
            ResourceSpec::Subnets(s) => {
                assert_eq!(s.availability_zones.len(), 3);
                assert!(s.nat_gateway_enabled);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &doc.resources[3].spec {
            ResourceSpec::Cluster(c) => {
                assert!(c.endpoint_public_access);
                assert_eq!(c.addons[0].resolve_conflicts_on_create, ConflictPolicy::Overwrite);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(doc.resources[3].depends_on, vec!["vpc".to_string()]);
    }

    #[test]
    fn test_unknown_kind_fails() {
        let raw = "label: {name: eks}\nresources:\n  - id: db\n    kind: database\n";
        assert!(parse_document(raw).is_err());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.yaml");
        std::fs::write(&path, STACK).unwrap();
        let doc = load_from_path(&path).unwrap();
        assert_eq!(doc.label.name, "eks");
        assert!(load_from_path(&dir.path().join("missing.yaml")).is_err());
    }
}
