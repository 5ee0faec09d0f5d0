//! Ownership tag scheme
//!
//! Tags are the only durable link between cloud instances and a logical
//! cluster. Every launched instance carries:
//!
//! - `autok3s=true`
//! - `cluster=<prefix><context>`
//! - `master=true|false`
//! - `name=<role>-<context>-<suffix>`
//! - user supplied `key=value` pairs
//!
//! Networking resources additionally get
//! `kubernetes.io/cluster/<context>=owned|shared` when the
//! cloud-controller-manager integration is enabled.

use std::collections::BTreeMap;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::context::ClusterContext;
use crate::node::Role;

/// Marker tag key present on every managed instance
pub const TAG_AUTOK3S: &str = "autok3s";
/// Tag key carrying the cluster context name
pub const TAG_CLUSTER: &str = "cluster";
/// Tag key carrying the role (`true` for masters)
pub const TAG_MASTER: &str = "master";
/// Tag key carrying the instance name
pub const TAG_NAME: &str = "name";
/// Prefix of the cloud-controller-manager co-ownership tag
pub const CCM_TAG_PREFIX: &str = "kubernetes.io/cluster/";

/// Keys that user tags may not override
pub const RESERVED_TAG_KEYS: &[&str] = &[TAG_AUTOK3S, TAG_CLUSTER, TAG_MASTER, TAG_NAME];

/// Length of the random instance name suffix
const NAME_SUFFIX_LEN: usize = 6;

/// Co-ownership of networking resources for the cloud-controller-manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcmOwnership {
    /// Created for this cluster
    Owned,
    /// Adopted, shared with other users
    Shared,
}

impl CcmOwnership {
    /// Tag value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owned => "owned",
            Self::Shared => "shared",
        }
    }
}

/// A set of tags; ordered so rendering is deterministic
pub type TagSet = BTreeMap<String, String>;

/// Tag filter matching every instance of a cluster
pub fn ownership_filter(ctx: &ClusterContext) -> TagSet {
    TagSet::from([
        (TAG_AUTOK3S.to_string(), "true".to_string()),
        (TAG_CLUSTER.to_string(), ctx.cluster_tag_value()),
    ])
}

/// Full tag set for one instance
pub fn instance_tags(ctx: &ClusterContext, role: Role, name: &str) -> TagSet {
    let mut tags: TagSet = ctx
        .tags
        .iter()
        .filter(|(k, _)| !RESERVED_TAG_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    tags.extend(ownership_filter(ctx));
    tags.insert(TAG_MASTER.to_string(), role.master_tag_value().to_string());
    tags.insert(TAG_NAME.to_string(), name.to_string());
    tags
}

/// Derive an instance name: `<role>-<context>-<random suffix>`
pub fn instance_name(ctx: &ClusterContext, role: Role) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-{}-{}", role, ctx.context_name(), suffix)
}

/// Deterministic name for a discover-or-create networking resource
pub fn resource_name(ctx: &ClusterContext, kind: &str) -> String {
    format!("autok3s-{}-{}", ctx.context_name(), kind)
}

/// Key of the cloud-controller-manager co-ownership tag
pub fn ccm_tag_key(ctx: &ClusterContext) -> String {
    format!("{}{}", CCM_TAG_PREFIX, ctx.context_name())
}

/// Cloud-controller-manager co-ownership tag
pub fn ccm_tags(ctx: &ClusterContext, ownership: CcmOwnership) -> TagSet {
    TagSet::from([(ccm_tag_key(ctx), ownership.as_str().to_string())])
}

/// Whether `tags` contains every pair of `filter`
pub fn matches_filter(tags: &TagSet, filter: &TagSet) -> bool {
    filter.iter().all(|(k, v)| tags.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ClusterContext, ProviderKind};

    fn ctx() -> ClusterContext {
        let mut ctx = ClusterContext::new("demo", "ap-guangzhou", ProviderKind::Tencent);
        ctx.tags.insert("team".to_string(), "infra".to_string());
        ctx
    }

    #[test]
    fn instance_tags_carry_ownership_role_and_user_tags() {
        let tags = instance_tags(&ctx(), Role::Master, "master-x");
        assert_eq!(tags.get(TAG_AUTOK3S).map(String::as_str), Some("true"));
        assert_eq!(
            tags.get(TAG_CLUSTER).map(String::as_str),
            Some("demo.ap-guangzhou.tencent")
        );
        assert_eq!(tags.get(TAG_MASTER).map(String::as_str), Some("true"));
        assert_eq!(tags.get(TAG_NAME).map(String::as_str), Some("master-x"));
        assert_eq!(tags.get("team").map(String::as_str), Some("infra"));
        assert!(matches_filter(&tags, &ownership_filter(&ctx())));
    }

    #[test]
    fn user_tags_cannot_override_reserved_keys() {
        let mut ctx = ctx();
        ctx.tags.insert(TAG_CLUSTER.to_string(), "hijack".to_string());
        let tags = instance_tags(&ctx, Role::Worker, "w");
        assert_eq!(
            tags.get(TAG_CLUSTER).map(String::as_str),
            Some("demo.ap-guangzhou.tencent")
        );
        assert_eq!(tags.get(TAG_MASTER).map(String::as_str), Some("false"));
    }

    #[test]
    fn instance_names_are_role_context_suffix() {
        let a = instance_name(&ctx(), Role::Worker);
        let b = instance_name(&ctx(), Role::Worker);
        assert!(a.starts_with("worker-demo.ap-guangzhou.tencent-"));
        assert_eq!(a.len(), "worker-demo.ap-guangzhou.tencent-".len() + NAME_SUFFIX_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn ccm_tags_use_context_name() {
        let tags = ccm_tags(&ctx(), CcmOwnership::Shared);
        assert_eq!(
            tags.get("kubernetes.io/cluster/demo.ap-guangzhou.tencent")
                .map(String::as_str),
            Some("shared")
        );
    }

    #[test]
    fn filter_requires_every_pair() {
        let tags = TagSet::from([(TAG_AUTOK3S.to_string(), "true".to_string())]);
        assert!(!matches_filter(&tags, &ownership_filter(&ctx())));
    }
}
