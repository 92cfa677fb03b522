//! # Apply Job
//!
//! Builds the Job that clones a GitRepo at its resolved commit and applies
//! the bundles found in it.
//!
//! The pod has two containers sharing a workspace volume: an init container
//! cloning the repository and the apply container. Cluster lookups (secrets,
//! the controller deployment) happen in [`load_inputs`]; [`build_job`] is pure.

use crate::config::ControllerConfig;
use crate::constants::{
    CA_BUNDLE_FILE, COMMIT_ANNOTATION, DEFAULT_BRANCH, FORCE_SYNC_GENERATION_LABEL, GENERATION_ANNOTATION,
    GENERATION_LABEL, REPO_LABEL, SHARD_LABEL,
};
use crate::controller::job::kstatus::CLONE_CONTAINER;
use crate::controller::names::{ca_bundle_name, job_name, service_account_name};
use crate::controller::rbac::owned_metadata;
use crate::crd::GitRepo;
use crate::store::ObjectStore;
use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath, PodSecurityContext, PodSpec,
    PodTemplateSpec, SeccompProfile, Secret, SecretKeySelector, SecretVolumeSource, SecurityContext, Toleration,
    Volume, VolumeMount,
};
use std::collections::BTreeMap;

const APPLY_CONTAINER: &str = "apply";
const HOME_DIR: &str = "/gitops-home";
const WORKSPACE_VOLUME: &str = "git-cloner";
const CLONER_TMP_VOLUME: &str = "git-cloner-empty-dir";
const CA_BUNDLE_VOLUME: &str = "additional-ca";
const CREDENTIAL_VOLUME: &str = "git-credential";
const HELM_MOUNT_PATH: &str = "/etc/gitops/helm";

const BASIC_AUTH_SECRET_TYPE: &str = "kubernetes.io/basic-auth";
const SSH_AUTH_SECRET_TYPE: &str = "kubernetes.io/ssh-auth";

/// Cluster state the job spec depends on
#[derive(Debug, Clone, Default)]
pub struct JobInputs {
    /// The repo's `clientSecretName` secret
    pub client_secret: Option<Secret>,
    /// Whether the `<name>-cabundle` secret exists
    pub ca_bundle_present: bool,
    /// The helm secret in effect (`helmSecretNameForPaths`, else `helmSecretName`)
    pub helm_secret: Option<Secret>,
    /// Tolerations of the controller's own deployment
    pub controller_tolerations: Vec<Toleration>,
}

/// Read everything [`build_job`] needs from the cluster
///
/// A `clientSecretName` that does not exist is an error; the job could not
/// authenticate anyway.
pub async fn load_inputs(store: &dyn ObjectStore, config: &ControllerConfig, repo: &GitRepo) -> Result<JobInputs> {
    let namespace = repo.namespace_or_default();

    let client_secret = if repo.spec.client_secret_name.is_empty() {
        None
    } else {
        let secret = store
            .get_secret(namespace, &repo.spec.client_secret_name)
            .await?
            .with_context(|| format!("client secret {namespace}/{} not found", repo.spec.client_secret_name))?;
        Some(secret)
    };

    let ca_bundle_present = store.get_secret(namespace, &ca_bundle_name(repo)).await?.is_some();

    let helm_secret_name = if repo.spec.helm_secret_name_for_paths.is_empty() {
        &repo.spec.helm_secret_name
    } else {
        &repo.spec.helm_secret_name_for_paths
    };
    let helm_secret = if helm_secret_name.is_empty() {
        None
    } else {
        store.get_secret(namespace, helm_secret_name).await?
    };

    let deployment = store
        .get_deployment(&config.controller_namespace, &config.controller_deployment_name)
        .await?
        .with_context(|| {
            format!(
                "controller deployment {}/{} not found",
                config.controller_namespace, config.controller_deployment_name
            )
        })?;
    let controller_tolerations = deployment
        .spec
        .and_then(|s| s.template.spec)
        .and_then(|s| s.tolerations)
        .unwrap_or_default();

    Ok(JobInputs {
        client_secret,
        ca_bundle_present,
        helm_secret,
        controller_tolerations,
    })
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }
}

fn secret_volume(name: &str, secret_name: &str, items: Option<Vec<KeyToPath>>) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            items,
            ..SecretVolumeSource::default()
        }),
        ..Volume::default()
    }
}

fn proxy_env(config: &ControllerConfig) -> Vec<EnvVar> {
    [
        ("HTTP_PROXY", &config.http_proxy),
        ("HTTPS_PROXY", &config.https_proxy),
        ("NO_PROXY", &config.no_proxy),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.as_ref().map(|v| env(name, v.as_str())))
    .collect()
}

fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        privileged: Some(false),
        run_as_non_root: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Capabilities::default()
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..SeccompProfile::default()
        }),
        ..SecurityContext::default()
    }
}

fn toleration(key: &str, value: &str) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some("Equal".to_string()),
        value: Some(value.to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Toleration::default()
    }
}

fn secret_has_key(secret: &Secret, key: &str) -> bool {
    secret.data.as_ref().is_some_and(|d| d.contains_key(key))
        || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
}

fn secret_flag(secret: &Secret, key: &str) -> bool {
    let from_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| std::str::from_utf8(&v.0).ok().map(str::to_string));
    let from_string_data = secret.string_data.as_ref().and_then(|d| d.get(key)).cloned();
    from_data
        .or(from_string_data)
        .and_then(|v| v.trim().parse::<bool>().ok())
        .unwrap_or(false)
}

fn secret_text(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .unwrap_or_default()
}

fn clone_container(config: &ControllerConfig, repo: &GitRepo, inputs: &JobInputs) -> Container {
    let mut args = vec![
        "gitops".to_string(),
        "gitcloner".to_string(),
        repo.spec.repo.clone(),
        "/workspace".to_string(),
    ];
    let mut mounts = vec![mount(WORKSPACE_VOLUME, "/workspace"), mount(CLONER_TMP_VOLUME, "/tmp")];

    if !repo.spec.branch.is_empty() {
        args.extend(["--branch".to_string(), repo.spec.branch.clone()]);
    } else if !repo.spec.revision.is_empty() {
        args.extend(["--revision".to_string(), repo.spec.revision.clone()]);
    } else {
        args.extend(["--branch".to_string(), DEFAULT_BRANCH.to_string()]);
    }

    if let Some(secret) = &inputs.client_secret {
        match secret.type_.as_deref() {
            Some(BASIC_AUTH_SECRET_TYPE) => {
                mounts.push(mount(CREDENTIAL_VOLUME, "/gitjob/credentials"));
                args.extend([
                    "--username".to_string(),
                    secret_text(secret, "username"),
                    "--password-file".to_string(),
                    "/gitjob/credentials/password".to_string(),
                ]);
            }
            Some(SSH_AUTH_SECRET_TYPE) => {
                mounts.push(mount(CREDENTIAL_VOLUME, "/gitjob/ssh"));
                args.extend([
                    "--ssh-private-key-file".to_string(),
                    "/gitjob/ssh/ssh-privatekey".to_string(),
                ]);
            }
            _ => {}
        }
    }

    if repo.spec.insecure_skip_tls_verify {
        args.push("--insecure-skip-tls".to_string());
    }

    if inputs.ca_bundle_present {
        mounts.push(mount(CA_BUNDLE_VOLUME, "/gitjob/cabundle"));
        args.extend([
            "--ca-bundle-file".to_string(),
            format!("/gitjob/cabundle/{CA_BUNDLE_FILE}"),
        ]);
    }

    let mut vars = vec![env("GITOPS_JSON_OUTPUT", "true")];
    vars.extend(proxy_env(config));

    Container {
        name: CLONE_CONTAINER.to_string(),
        image: Some(config.gitjob_image.clone()),
        command: Some(vec!["log.sh".to_string()]),
        args: Some(args),
        volume_mounts: Some(mounts),
        env: Some(vars),
        security_context: Some(restricted_security_context()),
        ..Container::default()
    }
}

/// Arguments, environment, volumes and mounts of the apply container
struct ApplyParts {
    args: Vec<String>,
    env: Vec<EnvVar>,
    volumes: Vec<Volume>,
    mounts: Vec<VolumeMount>,
}

fn bundle_labels(repo: &GitRepo) -> String {
    let mut labels: BTreeMap<String, String> = repo.metadata.labels.clone().unwrap_or_default();
    labels.insert(REPO_LABEL.to_string(), repo.name().to_string());
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn apply_parts(config: &ControllerConfig, repo: &GitRepo, inputs: &JobInputs) -> ApplyParts {
    let spec = &repo.spec;
    let mut args = vec![
        "gitops".to_string(),
        "apply".to_string(),
        format!("--label={}", bundle_labels(repo)),
        "--namespace".to_string(),
        repo.namespace_or_default().to_string(),
        "--service-account".to_string(),
        spec.service_account.clone(),
        format!("--sync-generation={}", spec.force_sync_generation),
        format!("--paused={}", spec.paused),
        "--target-namespace".to_string(),
        spec.target_namespace.clone(),
    ];
    let mut vars = vec![
        env("HOME", HOME_DIR),
        env("GITOPS_JSON_OUTPUT", "true"),
        env("JOB_NAME", job_name(repo)),
        env("GITOPS_APPLY_CONFLICT_RETRIES", config.apply_conflict_retries.to_string()),
    ];
    let mut volumes = vec![empty_dir("gitops-tmp-empty-dir"), empty_dir("gitops-home-empty-dir")];
    let mut mounts = vec![
        mount("gitops-tmp-empty-dir", "/tmp"),
        mount("gitops-home-empty-dir", HOME_DIR),
    ];

    if let Some(secret) = &inputs.helm_secret {
        let by_path = !spec.helm_secret_name_for_paths.is_empty();
        let (secret_name, volume_name) = if by_path {
            (spec.helm_secret_name_for_paths.as_str(), "helm-secret-by-path")
        } else {
            (spec.helm_secret_name.as_str(), "helm-secret")
        };
        volumes.push(secret_volume(volume_name, secret_name, None));
        mounts.push(mount(volume_name, HELM_MOUNT_PATH));

        let has_ca_certs = secret_has_key(secret, "cacerts");
        if has_ca_certs {
            let cert_volume = format!("{volume_name}-cert");
            volumes.push(secret_volume(
                &cert_volume,
                secret_name,
                Some(vec![KeyToPath {
                    key: "cacerts".to_string(),
                    path: "cacert.crt".to_string(),
                    ..KeyToPath::default()
                }]),
            ));
            mounts.push(mount(&cert_volume, "/etc/ssl/certs"));
        }

        if by_path {
            args.extend([
                "--helm-credentials-by-path-file".to_string(),
                format!("{HELM_MOUNT_PATH}/secrets-path.yaml"),
            ]);
        } else {
            args.extend([
                "--password-file".to_string(),
                format!("{HELM_MOUNT_PATH}/password"),
                "--ssh-privatekey-file".to_string(),
                format!("{HELM_MOUNT_PATH}/ssh-privatekey"),
                "--cacerts-file".to_string(),
                format!("{HELM_MOUNT_PATH}/cacerts"),
            ]);
            if secret_flag(secret, "insecureSkipVerify") {
                args.push("--helm-insecure-skip-tls".to_string());
            }
            if secret_flag(secret, "basicHTTP") {
                args.push("--helm-basic-http".to_string());
            }
            vars.push(EnvVar {
                name: "HELM_USERNAME".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret_name.to_string(),
                        key: "username".to_string(),
                        optional: Some(true),
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            });
        }
        vars.push(env_git_ssh_command());
    }

    args.extend(["--".to_string(), repo.name().to_string()]);
    if spec.paths.is_empty() {
        args.push(".".to_string());
    } else {
        args.extend(spec.paths.iter().cloned());
    }

    ApplyParts {
        args,
        env: vars,
        volumes,
        mounts,
    }
}

fn env_git_ssh_command() -> EnvVar {
    env("GIT_SSH_COMMAND", "ssh -o stricthostkeychecking=no")
}

fn job_metadata(repo: &GitRepo) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
    let commit = repo.status.as_ref().map(|s| s.commit.clone()).unwrap_or_default();
    let mut labels = BTreeMap::from([
        (
            FORCE_SYNC_GENERATION_LABEL.to_string(),
            repo.spec.force_sync_generation.to_string(),
        ),
        (GENERATION_LABEL.to_string(), repo.generation().to_string()),
    ]);
    // jobs carry the repo's shard so other replicas ignore their events
    if let Some(shard) = repo.label(SHARD_LABEL) {
        labels.insert(SHARD_LABEL.to_string(), shard.to_string());
    }

    let mut metadata = owned_metadata(repo, job_name(repo));
    metadata.labels = Some(labels);
    metadata.annotations = Some(BTreeMap::from([
        (GENERATION_ANNOTATION.to_string(), repo.generation().to_string()),
        (COMMIT_ANNOTATION.to_string(), commit),
    ]));
    metadata
}

/// The apply job for the repo's current `status.commit`
#[must_use]
pub fn build_job(config: &ControllerConfig, repo: &GitRepo, inputs: &JobInputs) -> Job {
    let commit = repo.status.as_ref().map(|s| s.commit.clone()).unwrap_or_default();
    let ApplyParts {
        args,
        env: apply_env,
        mut volumes,
        mounts,
    } = apply_parts(config, repo, inputs);

    volumes.push(empty_dir(WORKSPACE_VOLUME));
    volumes.push(empty_dir(CLONER_TMP_VOLUME));
    if inputs.ca_bundle_present {
        volumes.push(secret_volume(CA_BUNDLE_VOLUME, &ca_bundle_name(repo), None));
    }
    if !repo.spec.client_secret_name.is_empty() {
        volumes.push(secret_volume(CREDENTIAL_VOLUME, &repo.spec.client_secret_name, None));
    }

    let mut apply = Container {
        name: APPLY_CONTAINER.to_string(),
        image: Some(config.gitjob_image.clone()),
        command: Some(vec!["log.sh".to_string()]),
        args: Some(args),
        working_dir: Some("/workspace/source".to_string()),
        volume_mounts: Some(mounts),
        env: Some(apply_env),
        security_context: Some(restricted_security_context()),
        ..Container::default()
    };
    apply
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(mount(WORKSPACE_VOLUME, "/workspace/source"));
    let container_env = apply.env.get_or_insert_with(Vec::new);
    container_env.push(env("COMMIT", commit));
    container_env.extend(proxy_env(config));

    let mut tolerations = vec![
        toleration("cattle.io/os", "linux"),
        toleration("node.cloudprovider.kubernetes.io/uninitialized", "true"),
    ];
    tolerations.extend(inputs.controller_tolerations.iter().cloned());

    Job {
        metadata: job_metadata(repo),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    init_containers: Some(vec![clone_container(config, repo, inputs)]),
                    containers: vec![apply],
                    volumes: Some(volumes),
                    security_context: Some(PodSecurityContext {
                        run_as_user: Some(1000),
                        ..PodSecurityContext::default()
                    }),
                    service_account_name: Some(service_account_name(repo)),
                    restart_policy: Some("Never".to_string()),
                    node_selector: Some(BTreeMap::from([(
                        "kubernetes.io/os".to_string(),
                        "linux".to_string(),
                    )])),
                    tolerations: Some(tolerations),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GitRepoSpec, GitRepoStatus};
    use k8s_openapi::ByteString;

    fn repo() -> GitRepo {
        let mut repo = GitRepo::new(
            "sample",
            GitRepoSpec {
                repo: "https://github.com/example/apps".to_string(),
                paths: vec!["simple".to_string()],
                force_sync_generation: 2,
                ..GitRepoSpec::default()
            },
        );
        repo.metadata.namespace = Some("fleet-local".to_string());
        repo.metadata.uid = Some("1234".to_string());
        repo.metadata.generation = Some(3);
        repo.status = Some(GitRepoStatus {
            commit: "c1".to_string(),
            ..GitRepoStatus::default()
        });
        repo
    }

    fn pod_spec(job: &Job) -> &PodSpec {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn test_job_identity_and_annotations() {
        let repo = repo();
        let job = build_job(&ControllerConfig::default(), &repo, &JobInputs::default());

        assert_eq!(job.metadata.name, Some(job_name(&repo)));
        let annotations = job.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[GENERATION_ANNOTATION], "3");
        assert_eq!(annotations[COMMIT_ANNOTATION], "c1");
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[FORCE_SYNC_GENERATION_LABEL], "2");
        assert_eq!(labels[GENERATION_LABEL], "3");
        assert!(!labels.contains_key(SHARD_LABEL));
        assert_eq!(job.metadata.owner_references.as_ref().unwrap()[0].name, "sample");
    }

    #[test]
    fn test_shard_label_is_copied() {
        let mut repo = repo();
        repo.metadata.labels = Some(BTreeMap::from([(SHARD_LABEL.to_string(), "shard1".to_string())]));
        let job = build_job(&ControllerConfig::default(), &repo, &JobInputs::default());
        assert_eq!(job.metadata.labels.as_ref().unwrap()[SHARD_LABEL], "shard1");
    }

    #[test]
    fn test_pod_runs_as_non_root_with_clone_init_container() {
        let job = build_job(&ControllerConfig::default(), &repo(), &JobInputs::default());
        let pod = pod_spec(&job);

        assert_eq!(pod.security_context.as_ref().unwrap().run_as_user, Some(1000));
        assert_eq!(pod.service_account_name.as_deref(), Some("git-sample"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, CLONE_CONTAINER);
        let args = init.args.as_ref().unwrap();
        assert_eq!(&args[2], "https://github.com/example/apps");
        assert!(args.windows(2).any(|w| w[0] == "--branch" && w[1] == "master"));
        assert!(!args.contains(&"--ca-bundle-file".to_string()));

        let apply = &pod.containers[0];
        assert_eq!(env_value(apply, "COMMIT"), Some("c1"));
        assert_eq!(env_value(apply, "GITOPS_APPLY_CONFLICT_RETRIES"), Some("1"));
        let apply_args = apply.args.as_ref().unwrap();
        assert_eq!(apply_args.last().map(String::as_str), Some("simple"));
        assert!(apply_args.contains(&"--sync-generation=2".to_string()));
        assert_eq!(
            apply.security_context.as_ref().unwrap().run_as_non_root,
            Some(true)
        );
    }

    #[test]
    fn test_tolerations_are_merged() {
        let inputs = JobInputs {
            controller_tolerations: vec![toleration("dedicated", "gitops")],
            ..JobInputs::default()
        };
        let job = build_job(&ControllerConfig::default(), &repo(), &inputs);
        let keys: Vec<_> = pod_spec(&job)
            .tolerations
            .as_ref()
            .unwrap()
            .iter()
            .filter_map(|t| t.key.clone())
            .collect();
        assert_eq!(
            keys,
            vec![
                "cattle.io/os".to_string(),
                "node.cloudprovider.kubernetes.io/uninitialized".to_string(),
                "dedicated".to_string(),
            ]
        );
    }

    #[test]
    fn test_credentials_and_ca_bundle_are_mounted() {
        let mut repo = repo();
        repo.spec.client_secret_name = "git-auth".to_string();
        let inputs = JobInputs {
            client_secret: Some(Secret {
                type_: Some(BASIC_AUTH_SECRET_TYPE.to_string()),
                data: Some(BTreeMap::from([(
                    "username".to_string(),
                    ByteString(b"deployer".to_vec()),
                )])),
                ..Secret::default()
            }),
            ca_bundle_present: true,
            ..JobInputs::default()
        };
        let job = build_job(&ControllerConfig::default(), &repo, &inputs);
        let pod = pod_spec(&job);

        let args = pod.init_containers.as_ref().unwrap()[0].args.clone().unwrap();
        assert!(args.windows(2).any(|w| w[0] == "--username" && w[1] == "deployer"));
        assert!(args.contains(&"--ca-bundle-file".to_string()));

        let volumes: Vec<_> = pod.volumes.as_ref().unwrap().iter().map(|v| v.name.as_str()).collect();
        assert!(volumes.contains(&CA_BUNDLE_VOLUME));
        assert!(volumes.contains(&CREDENTIAL_VOLUME));
    }

    #[test]
    fn test_proxy_env_is_forwarded() {
        let config = ControllerConfig {
            https_proxy: Some("http://proxy:3128".to_string()),
            ..ControllerConfig::default()
        };
        let job = build_job(&config, &repo(), &JobInputs::default());
        let pod = pod_spec(&job);
        assert_eq!(env_value(&pod.containers[0], "HTTPS_PROXY"), Some("http://proxy:3128"));
        assert_eq!(
            env_value(&pod.init_containers.as_ref().unwrap()[0], "HTTPS_PROXY"),
            Some("http://proxy:3128")
        );
        assert_eq!(env_value(&pod.containers[0], "HTTP_PROXY"), None);
    }
}
