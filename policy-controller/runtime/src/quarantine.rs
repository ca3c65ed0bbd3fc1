//! Scales a reported pod's group of deployments to zero.

use crate::{
    k8s::{annotations::PolicyAnnotations, labels::Map, Deployment, Pod, ResourceExt, Selector},
    repository::Repository,
};
use anyhow::Result;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Quarantine<R> {
    repo: R,
}

impl<R: Repository> Quarantine<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Runs the action configured on the pod's deployment and returns the
    /// names of the deployments that were scaled to zero.
    pub async fn act(&self, pod_name: &str) -> Result<Vec<String>> {
        let Some((owner, pod)) = self.find_owner(pod_name).await? else {
            info!(pod = %pod_name, "No deployment owns the pod");
            return Ok(vec![]);
        };
        let ns = owner.namespace().unwrap_or_default();

        let policy = PolicyAnnotations::from_map(owner.annotations());
        if !policy.action.quarantines() {
            info!(%ns, pod = %pod_name, action = %policy.action, "Action does not quarantine");
            return Ok(vec![]);
        }

        let group = group_labels(&policy, &pod);
        if group.is_empty() {
            warn!(
                %ns,
                pod = %pod_name,
                group_label = %policy.group_label,
                "Pod carries none of the group labels"
            );
            return Ok(vec![]);
        }
        let selector = Selector::from_map(group);
        info!(%ns, pod = %pod_name, %selector, "Quarantining group");

        let mut quarantined = Vec::new();
        for target in self.repo.list_deployments(Some(&ns), &selector).await? {
            let name = target.name_any();
            // Re-read so the update carries the current resource version.
            let mut deployment = self.repo.get_deployment(&ns, &name).await?;
            if let Some(spec) = deployment.spec.as_mut() {
                spec.replicas = Some(0);
            }
            self.repo.update_deployment(&deployment).await?;
            info!(%ns, deployment = %name, "Scaled deployment to zero");
            quarantined.push(name);
        }
        Ok(quarantined)
    }

    /// Finds the first deployment, in any namespace, whose pods include the
    /// named pod.
    async fn find_owner(&self, pod_name: &str) -> Result<Option<(Deployment, Pod)>> {
        let deployments = self.repo.list_deployments(None, &Selector::default()).await?;
        for deployment in deployments {
            let Some(spec) = deployment.spec.as_ref() else {
                continue;
            };
            let selector = Selector::from(&spec.selector);
            if selector.is_empty() {
                continue;
            }
            let ns = deployment.namespace().unwrap_or_default();
            let pods = match self.repo.list_pods(Some(&ns), &selector).await {
                Ok(pods) => pods,
                Err(error) => {
                    debug!(%error, %ns, deployment = %deployment.name_any(), "Failed to list pods");
                    continue;
                }
            };
            if let Some(pod) = pods.into_iter().find(|p| p.name_any() == pod_name) {
                return Ok(Some((deployment, pod)));
            }
        }
        Ok(None)
    }
}

/// The pod's values for the policy's group label keys, or for all of its
/// labels if the policy names none.
fn group_labels(policy: &PolicyAnnotations, pod: &Pod) -> Map {
    let labels = pod.labels();
    if policy.group_label.is_empty() {
        return labels.clone();
    }
    policy
        .group_label
        .keys()
        .filter_map(|k| labels.get(k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn pod(labels: Map) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.labels = Some(labels);
        pod
    }

    #[test]
    fn group_from_named_keys() {
        let policy = PolicyAnnotations {
            group_label: "app--tier--missing".parse().unwrap(),
            ..Default::default()
        };
        let pod = pod(btreemap! {
            "app".to_string() => "web".to_string(),
            "tier".to_string() => "front".to_string(),
            "pod-template-hash".to_string() => "abc".to_string(),
        });
        assert_eq!(
            group_labels(&policy, &pod),
            btreemap! {
                "app".to_string() => "web".to_string(),
                "tier".to_string() => "front".to_string(),
            }
        );
    }

    #[test]
    fn group_defaults_to_all_labels() {
        let labels = btreemap! {
            "app".to_string() => "web".to_string(),
            "tier".to_string() => "front".to_string(),
        };
        assert_eq!(
            group_labels(&PolicyAnnotations::default(), &pod(labels.clone())),
            labels
        );
    }
}
