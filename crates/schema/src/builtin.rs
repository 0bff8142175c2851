//! Built-in kinds, the catalog's answer before (or without) discovery.

use crate::KindSchema;

/// Pod spec sequences that merge by key, relative to a pod spec.
const POD_SPEC_KEYS: &[(&str, &str)] = &[
    ("containers", "name"),
    ("initContainers", "name"),
    ("ephemeralContainers", "name"),
    ("volumes", "name"),
    ("imagePullSecrets", "name"),
    ("containers.env", "name"),
    ("containers.ports", "containerPort"),
    ("containers.volumeMounts", "mountPath"),
    ("initContainers.env", "name"),
    ("initContainers.volumeMounts", "mountPath"),
];

fn with_pod_spec(mut k: KindSchema, prefix: &str) -> KindSchema {
    for (path, key) in POD_SPEC_KEYS {
        k = k.with_merge_key(&format!("{}.{}", prefix, path), key);
    }
    k
}

pub(crate) fn kinds() -> Vec<KindSchema> {
    let ns = |av: &str, kind: &str, plural: &str| KindSchema::new(av, kind, plural, true);
    let cluster = |av: &str, kind: &str, plural: &str| KindSchema::new(av, kind, plural, false);
    vec![
        // core
        ns("v1", "ConfigMap", "configmaps"),
        ns("v1", "Secret", "secrets"),
        ns("v1", "Service", "services").with_merge_key("spec.ports", "port"),
        ns("v1", "ServiceAccount", "serviceaccounts").with_merge_key("secrets", "name"),
        with_pod_spec(ns("v1", "Pod", "pods"), "spec"),
        with_pod_spec(ns("v1", "ReplicationController", "replicationcontrollers"), "spec.template.spec"),
        ns("v1", "PersistentVolumeClaim", "persistentvolumeclaims"),
        ns("v1", "Endpoints", "endpoints"),
        ns("v1", "Event", "events"),
        ns("v1", "LimitRange", "limitranges"),
        ns("v1", "ResourceQuota", "resourcequotas"),
        cluster("v1", "Namespace", "namespaces"),
        cluster("v1", "Node", "nodes"),
        cluster("v1", "PersistentVolume", "persistentvolumes"),
        // apps
        with_pod_spec(ns("apps/v1", "Deployment", "deployments"), "spec.template.spec")
            .with_excluded(r#"metadata.annotations."deployment.kubernetes.io/revision""#),
        with_pod_spec(ns("apps/v1", "StatefulSet", "statefulsets"), "spec.template.spec"),
        with_pod_spec(ns("apps/v1", "DaemonSet", "daemonsets"), "spec.template.spec"),
        with_pod_spec(ns("apps/v1", "ReplicaSet", "replicasets"), "spec.template.spec"),
        // batch
        with_pod_spec(ns("batch/v1", "Job", "jobs"), "spec.template.spec"),
        with_pod_spec(ns("batch/v1", "CronJob", "cronjobs"), "spec.jobTemplate.spec.template.spec"),
        // networking / policy / autoscaling
        ns("networking.k8s.io/v1", "Ingress", "ingresses"),
        ns("networking.k8s.io/v1", "NetworkPolicy", "networkpolicies"),
        cluster("networking.k8s.io/v1", "IngressClass", "ingressclasses"),
        ns("policy/v1", "PodDisruptionBudget", "poddisruptionbudgets"),
        ns("autoscaling/v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers"),
        // rbac
        ns("rbac.authorization.k8s.io/v1", "Role", "roles"),
        ns("rbac.authorization.k8s.io/v1", "RoleBinding", "rolebindings"),
        cluster("rbac.authorization.k8s.io/v1", "ClusterRole", "clusterroles"),
        cluster("rbac.authorization.k8s.io/v1", "ClusterRoleBinding", "clusterrolebindings"),
        // storage / extensions
        cluster("storage.k8s.io/v1", "StorageClass", "storageclasses"),
        cluster("apiextensions.k8s.io/v1", "CustomResourceDefinition", "customresourcedefinitions")
            .with_merge_key("spec.versions", "name"),
    ]
}
