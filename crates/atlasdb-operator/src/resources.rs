//! Kubernetes Resource Builders
//!
//! This module generates the desired form of every child resource (StatefulSet,
//! Services, Secrets) from a PostgresCluster. Builders are pure: the same cluster
//! always yields the same manifests, which is what makes the upsert diff stable.

use crate::credentials::ConnectionInfo;
use crate::crd::PostgresCluster;
use crate::error::{OperatorError, Result};
use crate::naming::{ClusterNames, POSTGRES_PORT, POSTGRES_PORT_NAME, SUPERUSER_USERNAME};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Secret, SecretKeySelector,
    Service, ServicePort, ServiceSpec, TCPSocketAction, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::Resource;
use std::collections::BTreeMap;

/// Mount path of the data volume inside the container
const DATA_MOUNT_PATH: &str = "/var/lib/postgresql/data";

/// Builder for generating Kubernetes resources from a PostgresCluster
pub struct ResourceBuilder<'a> {
    cluster: &'a PostgresCluster,
    names: ClusterNames,
    owner: OwnerReference,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    ///
    /// The cluster must have been read from the store: its uid is required for
    /// the controller reference placed on every child.
    pub fn new(cluster: &'a PostgresCluster) -> Result<Self> {
        let names = ClusterNames::for_cluster(cluster)?;
        let uid = cluster.metadata.uid.clone().ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "cluster '{}' has no uid; owner references need the stored object",
                names.cluster()
            ))
        })?;

        let owner = OwnerReference {
            api_version: PostgresCluster::api_version(&()).to_string(),
            kind: PostgresCluster::kind(&()).to_string(),
            name: names.cluster().to_string(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        };

        Ok(Self {
            cluster,
            names,
            owner,
        })
    }

    /// Child names for this cluster
    pub fn names(&self) -> &ClusterNames {
        &self.names
    }

    /// Controller reference pointing at the cluster
    pub fn owner_reference(&self) -> OwnerReference {
        self.owner.clone()
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.names.namespace().to_string()),
            labels: Some(self.cluster.spec.get_labels(self.names.cluster())),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build the StatefulSet running the PostgreSQL instances
    pub fn build_statefulset(&self) -> StatefulSet {
        let spec = &self.cluster.spec;
        let selector_labels = spec.get_selector_labels(self.names.cluster());

        let pod_spec = PodSpec {
            containers: vec![self.build_container()],
            ..Default::default()
        };

        StatefulSet {
            metadata: self.metadata(self.names.workload()),
            spec: Some(StatefulSetSpec {
                service_name: self.names.headless_service(),
                replicas: Some(spec.instances),
                selector: LabelSelector {
                    match_labels: Some(selector_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector_labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                volume_claim_templates: Some(vec![self.build_pvc_template()]),
                pod_management_policy: Some("OrderedReady".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the PostgreSQL container
    fn build_container(&self) -> Container {
        let secret_ref = |key: &str| EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: self.names.superuser_secret(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        };

        let env = vec![
            EnvVar {
                name: "POSTGRES_USER".to_string(),
                value_from: Some(secret_ref("username")),
                ..Default::default()
            },
            EnvVar {
                name: "POSTGRES_PASSWORD".to_string(),
                value_from: Some(secret_ref("password")),
                ..Default::default()
            },
            // initdb refuses a mount point that contains lost+found
            EnvVar {
                name: "PGDATA".to_string(),
                value: Some(format!("{}/pgdata", DATA_MOUNT_PATH)),
                ..Default::default()
            },
        ];

        let tcp_probe = |initial_delay_seconds: i32| Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(POSTGRES_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial_delay_seconds),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        };

        Container {
            name: POSTGRES_PORT_NAME.to_string(),
            image: Some(self.cluster.spec.get_image()),
            env: Some(env),
            ports: Some(vec![ContainerPort {
                name: Some(POSTGRES_PORT_NAME.to_string()),
                container_port: POSTGRES_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            readiness_probe: Some(tcp_probe(5)),
            liveness_probe: Some(tcp_probe(30)),
            volume_mounts: Some(vec![VolumeMount {
                name: "data".to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    /// Build PVC template for StatefulSet
    fn build_pvc_template(&self) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert(
            "storage".to_string(),
            Quantity(self.cluster.spec.storage_size.clone()),
        );

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn postgres_service_port() -> ServicePort {
        ServicePort {
            name: Some(POSTGRES_PORT_NAME.to_string()),
            port: POSTGRES_PORT,
            target_port: Some(IntOrString::Int(POSTGRES_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }
    }

    /// Build the headless service for per-pod DNS
    pub fn build_headless_service(&self) -> Service {
        Service {
            metadata: self.metadata(self.names.headless_service()),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(
                    self.cluster
                        .spec
                        .get_selector_labels(self.names.cluster()),
                ),
                ports: Some(vec![Self::postgres_service_port()]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the client-facing read-write service
    pub fn build_client_service(&self) -> Service {
        Service {
            metadata: self.metadata(self.names.client_service()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(
                    self.cluster
                        .spec
                        .get_selector_labels(self.names.cluster()),
                ),
                ports: Some(vec![Self::postgres_service_port()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the superuser credential secret around an already generated password
    pub fn build_superuser_secret(&self, password: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(
            "username".to_string(),
            ByteString(SUPERUSER_USERNAME.as_bytes().to_vec()),
        );
        data.insert(
            "password".to_string(),
            ByteString(password.as_bytes().to_vec()),
        );

        Secret {
            metadata: self.metadata(self.names.superuser_secret()),
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Build the connection-info secret
    pub fn build_connection_secret(&self, info: &ConnectionInfo) -> Secret {
        let data = info
            .to_data()
            .into_iter()
            .map(|(k, v)| (k, ByteString(v.into_bytes())))
            .collect();

        Secret {
            metadata: self.metadata(self.names.connection_secret()),
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::PostgresClusterSpec;

    pub(crate) fn create_test_cluster(name: &str, instances: i32) -> PostgresCluster {
        let mut cluster = PostgresCluster::new(
            name,
            PostgresClusterSpec {
                instances,
                version: "16".to_string(),
                storage_size: "10Gi".to_string(),
                superuser_secret_name: None,
            },
        );
        cluster.metadata.namespace = Some("a".to_string());
        cluster.metadata.uid = Some("test-uid-123".to_string());
        cluster
    }

    #[test]
    fn test_build_statefulset() {
        let cluster = create_test_cluster("pg1", 3);
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let sts = builder.build_statefulset();

        assert_eq!(sts.metadata.name, Some("pg1".to_string()));
        assert_eq!(sts.metadata.namespace, Some("a".to_string()));
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "pg1");

        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image, Some("postgres:16".to_string()));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 5432);

        let pvc = &spec.volume_claim_templates.as_ref().unwrap()[0];
        let requests = pvc
            .spec
            .as_ref()
            .unwrap()
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap();
        assert_eq!(requests.get("storage"), Some(&Quantity("10Gi".to_string())));
    }

    #[test]
    fn test_statefulset_reads_password_from_superuser_secret() {
        let cluster = create_test_cluster("pg1", 1);
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let sts = builder.build_statefulset();
        let container = &sts.spec.unwrap().template.spec.unwrap().containers[0];
        let password = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "POSTGRES_PASSWORD")
            .unwrap();
        let key_ref = password
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(key_ref.name, "pg1-superuser");
        assert_eq!(key_ref.key, "password");
    }

    #[test]
    fn test_build_headless_service() {
        let cluster = create_test_cluster("pg1", 3);
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let svc = builder.build_headless_service();

        assert_eq!(svc.metadata.name, Some("pg1".to_string()));
        assert_eq!(
            svc.spec.as_ref().unwrap().cluster_ip,
            Some("None".to_string())
        );
    }

    #[test]
    fn test_build_client_service() {
        let cluster = create_test_cluster("pg1", 3);
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let svc = builder.build_client_service();

        assert_eq!(svc.metadata.name, Some("pg1-rw".to_string()));
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.type_, Some("ClusterIP".to_string()));
        assert_eq!(spec.ports.as_ref().unwrap().len(), 1);
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 5432);
    }

    #[test]
    fn test_services_select_workload_pods() {
        let cluster = create_test_cluster("pg1", 3);
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let sts = builder.build_statefulset();
        let pod_labels = sts
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .labels
            .unwrap();

        for svc in [
            builder.build_headless_service(),
            builder.build_client_service(),
        ] {
            let selector = svc.spec.unwrap().selector.unwrap();
            for (k, v) in selector {
                assert_eq!(pod_labels.get(&k), Some(&v));
            }
        }
    }

    #[test]
    fn test_build_superuser_secret() {
        let cluster = create_test_cluster("pg1", 1);
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let secret = builder.build_superuser_secret("s3cret");
        let data = secret.data.as_ref().unwrap();
        assert_eq!(secret.metadata.name, Some("pg1-superuser".to_string()));
        assert_eq!(data["username"], ByteString(b"postgres".to_vec()));
        assert_eq!(data["password"], ByteString(b"s3cret".to_vec()));
    }

    #[test]
    fn test_owner_references() {
        let cluster = create_test_cluster("pg1", 3);
        let builder = ResourceBuilder::new(&cluster).unwrap();
        let sts = builder.build_statefulset();

        let owner_refs = sts.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owner_refs.len(), 1);
        assert_eq!(owner_refs[0].kind, "PostgresCluster");
        assert_eq!(owner_refs[0].api_version, "databases.atlasdb.io/v1alpha1");
        assert_eq!(owner_refs[0].name, "pg1");
        assert_eq!(owner_refs[0].uid, "test-uid-123");
        assert_eq!(owner_refs[0].controller, Some(true));
    }

    #[test]
    fn test_builder_requires_uid() {
        let mut cluster = create_test_cluster("pg1", 1);
        cluster.metadata.uid = None;
        assert!(ResourceBuilder::new(&cluster).is_err());
    }

    #[test]
    fn test_builders_are_deterministic_and_leave_input_untouched() {
        let cluster = create_test_cluster("pg1", 2);
        let before = cluster.clone();
        let builder = ResourceBuilder::new(&cluster).unwrap();

        assert_eq!(builder.build_statefulset(), builder.build_statefulset());
        assert_eq!(
            builder.build_client_service(),
            builder.build_client_service()
        );
        drop(builder);
        assert_eq!(cluster, before);
    }
}
