use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineLog};
use crate::model::{Deployment, DeploymentStatus, VolumeMapping};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::services::docker::{
    build_create_command, exec_checked, mint_volume_name, random_hex, resolve_volume_path,
    verify_remote_path, CreateSpec,
};
use crate::services::transport::shell_quote;

use super::types::{
    MigrationOutcome, MigrationRequest, STAGE_ARCHIVE, STAGE_CREATE, STAGE_DOWNLOAD,
    STAGE_FINALIZE, STAGE_PREPARE, STAGE_STOP, STAGE_UPLOAD,
};
use super::MigrationService;

struct StageFailure {
    stage: &'static str,
    source: anyhow::Error,
}

fn at(stage: &'static str) -> impl FnOnce(anyhow::Error) -> StageFailure {
    move |source| StageFailure { stage, source }
}

/// Volume being carried across: once the target is prepared, its resolved
/// path and mapping there.
struct VolumePlan {
    target_path: String,
    target_mapping: VolumeMapping,
}

/// Transient locations used by one migration: the remote archive and
/// staging directory (same paths on source and target) and the local
/// transfer file. All of them are deleted on completion or failure.
struct TransferPaths {
    remote_archive: String,
    staging_dir: String,
    local_archive: std::path::PathBuf,
}

impl TransferPaths {
    fn new(config: &crate::config::CoreConfig, deployment_id: &str) -> Self {
        let archive_name = format!(
            "migration_{}_{}.tar.gz",
            deployment_id,
            Utc::now().format("%Y%m%d%H%M%S")
        );
        Self {
            remote_archive: format!("/tmp/{archive_name}"),
            staging_dir: format!("/tmp/fleet_stage_{}", random_hex(6)),
            local_archive: config.transfer_tmp_path.join(&archive_name),
        }
    }
}

impl MigrationService {
    /// Relocate or duplicate a deployment onto the target server.
    ///
    /// Cancellation is honored at the safe points before archiving,
    /// downloading and target preparation; once container creation begins it
    /// is refused and the migration completes or fails on its own terms. On
    /// failure before Finalize the source container is restarted
    /// (best-effort), its status restored to `running`, and a
    /// [`PipelineError`] with the full stage log is raised. A container
    /// already created on the target is deliberately left in place for
    /// operator cleanup; the error says so. The transient archive and
    /// staging files are removed on completion and on failure alike.
    pub fn migrate(
        &self,
        request: &MigrationRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<MigrationOutcome> {
        let mut log = PipelineLog::new();
        let paths = TransferPaths::new(&self.config, &request.deployment.id);
        match self.run_pipeline(request, &paths, progress, cancel, &mut log) {
            Ok(outcome) => Ok(outcome),
            Err(failure) => {
                self.rollback_source(request, failure.stage, &mut log);
                self.cleanup_transfer(request, &paths);
                let source = if matches!(failure.stage, STAGE_CREATE | STAGE_FINALIZE) {
                    failure.source.context(
                        "the container created on the target was left in place; \
                         operator intervention may be required",
                    )
                } else {
                    failure.source
                };
                Err(anyhow::Error::new(PipelineError::new(
                    &request.deployment.id,
                    failure.stage,
                    log,
                    source,
                )))
            }
        }
    }

    fn run_pipeline(
        &self,
        request: &MigrationRequest,
        paths: &TransferPaths,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
        log: &mut PipelineLog,
    ) -> std::result::Result<MigrationOutcome, StageFailure> {
        let deployment = &request.deployment;
        let source = &request.source_server;
        let target = &request.target_server;
        let has_volumes = !deployment.volumes.is_empty();

        let remote_archive = &paths.remote_archive;
        let staging_dir = &paths.staging_dir;
        let local_archive = &paths.local_archive;

        // Stage 1: mark the deployment and stop the source container.
        report(progress, log, STAGE_STOP, 5, "stopping source container");
        self.store
            .set_status(&deployment.id, DeploymentStatus::Migrating)
            .map_err(at(STAGE_STOP))?;
        let stop = self
            .transport
            .exec(
                source,
                &format!("docker stop {}", shell_quote(&deployment.container_name)),
            )
            .map_err(at(STAGE_STOP))?;
        if !stop.success() {
            // Absence is not fatal; the volumes are what we are moving.
            log.warn(
                STAGE_STOP,
                format!("docker stop exited {}: {}", stop.exit_code, stop.stderr.trim()),
            );
        }

        // Stage 2: archive the declared volumes on the source, each under an
        // index-numbered subdirectory so they reassemble unambiguously.
        let mut plans: Vec<VolumePlan> = Vec::with_capacity(deployment.volumes.len());
        if has_volumes {
            check_cancelled(cancel, STAGE_ARCHIVE)?;
            report(
                progress,
                log,
                STAGE_ARCHIVE,
                20,
                format!("archiving {} volume(s)", deployment.volumes.len()),
            );
            for (index, volume) in deployment.volumes.iter().enumerate() {
                let path = resolve_volume_path(
                    self.transport.as_ref(),
                    source,
                    volume,
                    &self.config.docker_volume_root,
                )
                .map_err(at(STAGE_ARCHIVE))?;
                verify_remote_path(self.transport.as_ref(), source, &path)
                    .map_err(at(STAGE_ARCHIVE))?;
                log.info(STAGE_ARCHIVE, format!("volume {index} resolved to {path}"));
                exec_checked(
                    self.transport.as_ref(),
                    source,
                    &format!(
                        "mkdir -p {dir} && cp -a {src} {dir}/",
                        dir = shell_quote(&format!("{staging_dir}/{index}")),
                        src = shell_quote(&format!("{path}/.")),
                    ),
                )
                .map_err(at(STAGE_ARCHIVE))?;
                plans.push(VolumePlan {
                    target_path: String::new(),
                    target_mapping: volume.clone(),
                });
            }
            exec_checked(
                self.transport.as_ref(),
                source,
                &format!(
                    "tar -czf {} -C {} .",
                    shell_quote(&remote_archive),
                    shell_quote(&staging_dir)
                ),
            )
            .map_err(at(STAGE_ARCHIVE))?;
            let _ = self.transport.exec(
                source,
                &format!("rm -rf {}", shell_quote(&staging_dir)),
            );

            // Stage 3: pull the archive into local temp storage.
            check_cancelled(cancel, STAGE_DOWNLOAD)?;
            report(progress, log, STAGE_DOWNLOAD, 40, "downloading volume archive");
            std::fs::create_dir_all(&self.config.transfer_tmp_path)
                .map_err(|err| at(STAGE_DOWNLOAD)(err.into()))?;
            self.transport
                .download(source, &remote_archive, &local_archive)
                .map_err(at(STAGE_DOWNLOAD))?;
            let _ = self.transport.exec(
                source,
                &format!("rm -f {}", shell_quote(&remote_archive)),
            );
        } else {
            log.info(STAGE_ARCHIVE, "deployment declares no volumes; skipping archive");
        }

        // Stage 4: mint fresh named volumes / ensure bind directories on the
        // target. Last safe cancellation point.
        check_cancelled(cancel, STAGE_PREPARE)?;
        report(progress, log, STAGE_PREPARE, 55, "preparing target volumes");
        for (index, plan) in plans.iter_mut().enumerate() {
            let volume = &deployment.volumes[index];
            if volume.is_bind_mount() {
                exec_checked(
                    self.transport.as_ref(),
                    target,
                    &format!("mkdir -p {}", shell_quote(&volume.host)),
                )
                .map_err(at(STAGE_PREPARE))?;
                plan.target_path = volume.host.clone();
            } else {
                let new_name = mint_volume_name(&request.new_container_name, index);
                exec_checked(
                    self.transport.as_ref(),
                    target,
                    &format!("docker volume create {}", shell_quote(&new_name)),
                )
                .map_err(at(STAGE_PREPARE))?;
                let fresh = VolumeMapping {
                    host: new_name.clone(),
                    container: volume.container.clone(),
                };
                plan.target_path = resolve_volume_path(
                    self.transport.as_ref(),
                    target,
                    &fresh,
                    &self.config.docker_volume_root,
                )
                .map_err(at(STAGE_PREPARE))?;
                log.info(
                    STAGE_PREPARE,
                    format!("volume {index}: {} -> {new_name}", volume.host),
                );
                plan.target_mapping = fresh;
            }
        }

        // Stage 5: push the archive to the target and fan the indexed
        // subdirectories out to their resolved paths. No cancellation from
        // here on; a container is about to be created.
        if has_volumes {
            report(progress, log, STAGE_UPLOAD, 70, "uploading volume archive to target");
            self.transport
                .upload(target, &local_archive, &remote_archive)
                .map_err(at(STAGE_UPLOAD))?;
            exec_checked(
                self.transport.as_ref(),
                target,
                &format!(
                    "mkdir -p {dir} && tar -xzf {archive} -C {dir}",
                    dir = shell_quote(&staging_dir),
                    archive = shell_quote(&remote_archive),
                ),
            )
            .map_err(at(STAGE_UPLOAD))?;
            for (index, plan) in plans.iter().enumerate() {
                exec_checked(
                    self.transport.as_ref(),
                    target,
                    &format!(
                        "mkdir -p {dst} && cp -a {src} {dst}/",
                        dst = shell_quote(&plan.target_path),
                        src = shell_quote(&format!("{staging_dir}/{index}/.")),
                    ),
                )
                .map_err(at(STAGE_UPLOAD))?;
            }
            let _ = self.transport.exec(
                target,
                &format!(
                    "rm -rf {} {}",
                    shell_quote(&staging_dir),
                    shell_quote(&remote_archive)
                ),
            );
        }

        // Stage 6: pull the image and create (not run) the container with
        // the merged configuration; record the new deployment as stopped.
        report(progress, log, STAGE_CREATE, 85, "creating container on target");
        exec_checked(
            self.transport.as_ref(),
            target,
            &format!("docker pull {}", shell_quote(&deployment.image)),
        )
        .map_err(at(STAGE_CREATE))?;

        let ports = request
            .new_port_mappings
            .clone()
            .unwrap_or_else(|| deployment.ports.clone());
        let target_volumes: Vec<VolumeMapping> =
            plans.iter().map(|plan| plan.target_mapping.clone()).collect();
        let create_command = build_create_command(&CreateSpec {
            container_name: &request.new_container_name,
            image: &deployment.image,
            ports: &ports,
            env: &deployment.env,
            volumes: &target_volumes,
            restart_policy: deployment.restart_policy.as_deref(),
            network_mode: deployment.network_mode.as_deref(),
            extra_args: &deployment.extra_args,
            command: deployment.command.as_deref(),
        });
        let created = exec_checked(self.transport.as_ref(), target, &create_command)
            .map_err(at(STAGE_CREATE))?;
        let new_container_id = created.stdout.trim().to_string();

        let new_deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            app_id: deployment.app_id.clone(),
            server_id: target.id.clone(),
            container_id: new_container_id,
            container_name: request.new_container_name.clone(),
            image: deployment.image.clone(),
            volumes: target_volumes,
            ports,
            env: deployment.env.clone(),
            restart_policy: deployment.restart_policy.clone(),
            network_mode: deployment.network_mode.clone(),
            extra_args: deployment.extra_args.clone(),
            command: deployment.command.clone(),
            status: DeploymentStatus::Stopped,
        };
        self.store
            .insert_deployment(&new_deployment)
            .map_err(at(STAGE_CREATE))?;
        log.info(
            STAGE_CREATE,
            format!("new deployment {} recorded as stopped", new_deployment.id),
        );

        // Stage 7: remove or restart the source, then clean local temp.
        report(progress, log, STAGE_FINALIZE, 95, "finalizing");
        if request.delete_original {
            let removed = self
                .transport
                .exec(
                    source,
                    &format!("docker rm -f {}", shell_quote(&deployment.container_name)),
                )
                .map_err(at(STAGE_FINALIZE))?;
            if !removed.success() {
                log.warn(
                    STAGE_FINALIZE,
                    format!("docker rm exited {}: {}", removed.exit_code, removed.stderr.trim()),
                );
            }
            self.store
                .remove_deployment(&deployment.id)
                .map_err(at(STAGE_FINALIZE))?;
        } else {
            let started = self
                .transport
                .exec(
                    source,
                    &format!("docker start {}", shell_quote(&deployment.container_name)),
                )
                .map_err(at(STAGE_FINALIZE))?;
            if !started.success() {
                log.warn(
                    STAGE_FINALIZE,
                    format!(
                        "docker start exited {}: {}",
                        started.exit_code,
                        started.stderr.trim()
                    ),
                );
            }
            self.store
                .set_status(&deployment.id, DeploymentStatus::Running)
                .map_err(at(STAGE_FINALIZE))?;
        }
        if has_volumes {
            if let Err(err) = std::fs::remove_file(&local_archive) {
                log.warn(
                    STAGE_FINALIZE,
                    format!("failed to remove local archive: {err}"),
                );
            }
        }
        report(progress, log, STAGE_FINALIZE, 100, "migration complete");

        Ok(MigrationOutcome {
            new_deployment_id: new_deployment.id,
        })
    }

    /// Best-effort restoration of the source deployment after a failure:
    /// restart the container and put the stored status back to `running`.
    /// Rollback failures are logged and never mask the original error.
    fn rollback_source(
        &self,
        request: &MigrationRequest,
        failed_stage: &str,
        log: &mut PipelineLog,
    ) {
        let deployment = &request.deployment;
        log.warn(
            failed_stage,
            "rolling back: restarting source container".to_string(),
        );
        match self.transport.exec(
            &request.source_server,
            &format!("docker start {}", shell_quote(&deployment.container_name)),
        ) {
            Ok(result) if !result.success() => {
                tracing::warn!(
                    deployment_id = %deployment.id,
                    exit_code = result.exit_code,
                    "rollback docker start failed"
                );
                log.warn(
                    failed_stage,
                    format!("rollback docker start exited {}", result.exit_code),
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(deployment_id = %deployment.id, error = %err, "rollback transport failure");
                log.warn(failed_stage, format!("rollback transport failure: {err:#}"));
            }
        }
        if let Err(err) = self
            .store
            .set_status(&deployment.id, DeploymentStatus::Running)
        {
            tracing::warn!(deployment_id = %deployment.id, error = %err, "rollback status restore failed");
            log.warn(failed_stage, format!("rollback status restore failed: {err:#}"));
        }
    }

    /// Best-effort removal of the transient transfer files after a failure:
    /// the local archive plus the staging directory and remote archive on
    /// both hosts.
    fn cleanup_transfer(&self, request: &MigrationRequest, paths: &TransferPaths) {
        if paths.local_archive.exists() {
            if let Err(err) = std::fs::remove_file(&paths.local_archive) {
                tracing::warn!(
                    path = %paths.local_archive.display(),
                    error = %err,
                    "failed to remove local transfer archive"
                );
            }
        }
        let sweep = format!(
            "rm -rf {} {}",
            shell_quote(&paths.staging_dir),
            shell_quote(&paths.remote_archive)
        );
        for server in [&request.source_server, &request.target_server] {
            let _ = self.transport.exec(server, &sweep);
        }
    }
}

fn check_cancelled(
    cancel: &CancellationToken,
    stage: &'static str,
) -> std::result::Result<(), StageFailure> {
    if cancel.is_cancelled() {
        return Err(StageFailure {
            stage,
            source: anyhow!("migration cancelled before stage '{stage}'"),
        });
    }
    Ok(())
}

fn report(
    progress: &dyn ProgressSink,
    log: &mut PipelineLog,
    stage: &str,
    percent: u8,
    message: impl Into<String>,
) {
    let message = message.into();
    log.info(stage, message.clone());
    progress.report(ProgressEvent {
        stage: stage.to_string(),
        percent,
        message,
    });
}
