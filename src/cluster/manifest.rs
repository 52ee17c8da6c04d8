//! Pod manifest for a sandbox.

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use super::config::ProvisionerConfig;
use super::{
    ANNOTATION_CREATED_AT, ANNOTATION_SANDBOX_ID, ANNOTATION_THREAD_ID, ANNOTATION_THREAD_KEY,
    LABEL_SANDBOX_ID, MANAGED_LABEL_KEY,
};
use crate::container::KEEPALIVE;
use crate::identity::ResolvedIdentity;

const WORKSPACE_VOLUME: &str = "workspace";

/// Build the pod object for `identity`, named `name`.
///
/// `last-used-ts` is deliberately absent: it is stamped only once the pod is
/// ready, so a pod still starting can never look idle.
pub fn pod_manifest(config: &ProvisionerConfig, name: &str, identity: &ResolvedIdentity) -> Value {
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut container = json!({
        "name": config.container_name,
        "image": config.worker_image,
        "command": ["sh", "-c", KEEPALIVE],
        "workingDir": config.workspace_dir,
        "volumeMounts": [{
            "name": WORKSPACE_VOLUME,
            "mountPath": config.workspace_dir,
        }],
    });
    if let Some(resources) = resources(config) {
        container["resources"] = resources;
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": config.namespace,
            "labels": {
                MANAGED_LABEL_KEY: "true",
                LABEL_SANDBOX_ID: identity.sandbox_id,
            },
            "annotations": {
                ANNOTATION_CREATED_AT: created_at,
                ANNOTATION_THREAD_ID: identity.thread_id,
                ANNOTATION_THREAD_KEY: identity.thread_key,
                ANNOTATION_SANDBOX_ID: identity.sandbox_id,
            },
        },
        "spec": {
            "restartPolicy": "Never",
            "automountServiceAccountToken": false,
            "terminationGracePeriodSeconds": 5,
            "containers": [container],
            "volumes": [{
                "name": WORKSPACE_VOLUME,
                "emptyDir": {},
            }],
        },
    })
}

fn resources(config: &ProvisionerConfig) -> Option<Value> {
    let section = |cpu: &Option<String>, memory: &Option<String>| {
        let mut map = Map::new();
        if let Some(cpu) = cpu {
            map.insert("cpu".into(), Value::from(cpu.as_str()));
        }
        if let Some(memory) = memory {
            map.insert("memory".into(), Value::from(memory.as_str()));
        }
        (!map.is_empty()).then_some(Value::Object(map))
    };

    let mut resources = Map::new();
    if let Some(requests) = section(&config.cpu_request, &config.memory_request) {
        resources.insert("requests".into(), requests);
    }
    if let Some(limits) = section(&config.cpu_limit, &config.memory_limit) {
        resources.insert("limits".into(), limits);
    }
    (!resources.is_empty()).then_some(Value::Object(resources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ANNOTATION_LAST_USED;

    fn identity() -> ResolvedIdentity {
        ResolvedIdentity {
            thread_id: "Thread 1".into(),
            thread_key: "thread-1".into(),
            sandbox_id: "thread-1".into(),
        }
    }

    #[test]
    fn test_manifest_shape() {
        let config = ProvisionerConfig::default();
        let pod = pod_manifest(&config, "agent-sandbox-abc", &identity());

        assert_eq!(pod["metadata"]["name"], "agent-sandbox-abc");
        assert_eq!(pod["metadata"]["labels"][MANAGED_LABEL_KEY], "true");
        assert_eq!(pod["metadata"]["annotations"][ANNOTATION_THREAD_ID], "Thread 1");
        assert!(pod["metadata"]["annotations"][ANNOTATION_LAST_USED].is_null());
        assert_eq!(pod["spec"]["restartPolicy"], "Never");
        assert_eq!(pod["spec"]["automountServiceAccountToken"], false);

        let container = &pod["spec"]["containers"][0];
        assert_eq!(container["name"], config.container_name);
        assert_eq!(container["workingDir"], "/workspace");
        assert_eq!(container["command"], json!(["sh", "-c", KEEPALIVE]));
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/workspace");
        assert!(container["resources"].is_null());
    }

    #[test]
    fn test_resources_only_when_configured() {
        let config = ProvisionerConfig {
            cpu_limit: Some("1".into()),
            memory_request: Some("256Mi".into()),
            ..Default::default()
        };
        let pod = pod_manifest(&config, "p", &identity());
        let resources = &pod["spec"]["containers"][0]["resources"];
        assert_eq!(resources["limits"]["cpu"], "1");
        assert!(resources["limits"]["memory"].is_null());
        assert_eq!(resources["requests"]["memory"], "256Mi");
    }
}
