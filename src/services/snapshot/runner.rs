use anyhow::{bail, Context, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::config::directory_size_bytes;
use crate::error::{PipelineError, PipelineLog, QuotaError};
use crate::model::{Deployment, DeploymentStatus, Server, Snapshot, SnapshotStatus};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::services::docker::{
    exec_checked, remote_file_size, resolve_volume_path, verify_remote_path,
};
use crate::services::transport::shell_quote;

use super::types::{RestoreRequest, SnapshotRequest};
use super::SnapshotService;

const STAGE_STOP: &str = "Stop container";
const STAGE_ARCHIVE: &str = "Archive volumes";
const STAGE_VERIFY: &str = "Verify archive";
const STAGE_DOWNLOAD: &str = "Download archive";
const STAGE_UPLOAD: &str = "Upload archive";
const STAGE_EXTRACT: &str = "Extract volumes";
const STAGE_FINALIZE: &str = "Finalize";

struct StageFailure {
    stage: &'static str,
    source: anyhow::Error,
}

fn at(stage: &'static str) -> impl FnOnce(anyhow::Error) -> StageFailure {
    move |source| StageFailure { stage, source }
}

impl SnapshotService {
    /// Archive the deployment's volumes into local backup storage.
    ///
    /// Zero-volume deployments and exhausted quota are rejected before any
    /// remote side effect; the container is never stopped for a request that
    /// cannot succeed. The archive is built root-rooted on the remote host,
    /// its concrete size is checked against the quota before download, and
    /// an oversized archive is deleted remotely without ever transferring.
    /// On any failure the container is restarted (best-effort) and the
    /// snapshot record finalized as `failed`, never left `creating`.
    pub fn create(
        &self,
        request: &SnapshotRequest,
        progress: &dyn ProgressSink,
    ) -> Result<Snapshot> {
        let deployment = &request.deployment;
        if deployment.volumes.is_empty() {
            bail!(
                "deployment {} declares no volumes; nothing to snapshot",
                deployment.id
            );
        }
        self.check_quota(0)?;

        let snapshot_id = Uuid::new_v4().to_string();
        let archive_filename = format!(
            "snapshot_{}_{}.tar.gz",
            deployment.id,
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let mut snapshot = Snapshot {
            id: snapshot_id,
            deployment_id: deployment.id.clone(),
            server_id: request.server.id.clone(),
            archive_filename,
            size_bytes: 0,
            notes: request.notes.clone(),
            status: SnapshotStatus::Creating,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.insert_snapshot(&snapshot)?;

        let mut log = PipelineLog::new();
        match self.run_create(request, &snapshot, progress, &mut log) {
            Ok(size_bytes) => {
                snapshot.size_bytes = size_bytes;
                snapshot.status = SnapshotStatus::Complete;
                self.store.update_snapshot(&snapshot)?;
                Ok(snapshot)
            }
            Err(failure) => {
                self.restore_running(deployment, &request.server, failure.stage, &mut log);
                self.cleanup_archives(&request.server, &snapshot.archive_filename);
                snapshot.status = SnapshotStatus::Failed;
                if let Err(err) = self.store.update_snapshot(&snapshot) {
                    tracing::warn!(snapshot_id = %snapshot.id, error = %err, "failed to finalize snapshot record");
                    log.warn(failure.stage, format!("snapshot record finalize failed: {err:#}"));
                }
                Err(anyhow::Error::new(PipelineError::new(
                    &deployment.id,
                    failure.stage,
                    log,
                    failure.source,
                )))
            }
        }
    }

    fn run_create(
        &self,
        request: &SnapshotRequest,
        snapshot: &Snapshot,
        progress: &dyn ProgressSink,
        log: &mut PipelineLog,
    ) -> std::result::Result<u64, StageFailure> {
        let deployment = &request.deployment;
        let server = &request.server;
        let remote_archive = format!("/tmp/{}", snapshot.archive_filename);

        report(progress, log, STAGE_STOP, 10, "stopping container");
        self.store
            .set_status(&deployment.id, DeploymentStatus::Snapshotting)
            .map_err(at(STAGE_STOP))?;
        self.stop_container(deployment, server, STAGE_STOP, log)
            .map_err(at(STAGE_STOP))?;

        // Archive every volume with paths relative to /, so a restore is a
        // plain extraction at the filesystem root.
        report(
            progress,
            log,
            STAGE_ARCHIVE,
            30,
            format!("archiving {} volume(s)", deployment.volumes.len()),
        );
        let mut relative_paths = Vec::with_capacity(deployment.volumes.len());
        for (index, volume) in deployment.volumes.iter().enumerate() {
            let path = resolve_volume_path(
                self.transport.as_ref(),
                server,
                volume,
                &self.config.docker_volume_root,
            )
            .map_err(at(STAGE_ARCHIVE))?;
            verify_remote_path(self.transport.as_ref(), server, &path)
                .map_err(at(STAGE_ARCHIVE))?;
            log.info(STAGE_ARCHIVE, format!("volume {index} resolved to {path}"));
            relative_paths.push(shell_quote(path.trim_start_matches('/')));
        }
        exec_checked(
            self.transport.as_ref(),
            server,
            &format!(
                "tar -czf {} -C / {}",
                shell_quote(&remote_archive),
                relative_paths.join(" ")
            ),
        )
        .map_err(at(STAGE_ARCHIVE))?;

        // Re-check the quota against the concrete archive size; an archive
        // that will not fit is removed remotely and never downloaded.
        report(progress, log, STAGE_VERIFY, 55, "verifying archive size");
        let size_bytes = remote_file_size(self.transport.as_ref(), server, &remote_archive)
            .map_err(at(STAGE_VERIFY))?;
        log.info(STAGE_VERIFY, format!("archive is {size_bytes} bytes"));
        if let Err(err) = self.check_quota(size_bytes) {
            let _ = self.transport.exec(
                server,
                &format!("rm -f {}", shell_quote(&remote_archive)),
            );
            return Err(at(STAGE_VERIFY)(err));
        }

        report(progress, log, STAGE_DOWNLOAD, 70, "downloading archive");
        std::fs::create_dir_all(&self.config.backup_storage_path)
            .map_err(|err| at(STAGE_DOWNLOAD)(err.into()))?;
        let local_archive = self.config.backup_storage_path.join(&snapshot.archive_filename);
        self.transport
            .download(server, &remote_archive, &local_archive)
            .map_err(at(STAGE_DOWNLOAD))?;
        let _ = self.transport.exec(
            server,
            &format!("rm -f {}", shell_quote(&remote_archive)),
        );

        report(progress, log, STAGE_FINALIZE, 90, "restarting container");
        self.start_container(deployment, server, STAGE_FINALIZE, log)
            .map_err(at(STAGE_FINALIZE))?;
        self.store
            .set_status(&deployment.id, DeploymentStatus::Running)
            .map_err(at(STAGE_FINALIZE))?;
        report(progress, log, STAGE_FINALIZE, 100, "snapshot complete");
        Ok(size_bytes)
    }

    /// Put an archived snapshot back in place over the deployment's volumes.
    pub fn restore(&self, request: &RestoreRequest, progress: &dyn ProgressSink) -> Result<()> {
        let local_archive = self
            .config
            .backup_storage_path
            .join(&request.snapshot.archive_filename);
        if !local_archive.is_file() {
            bail!(
                "snapshot archive {} not found in backup storage",
                request.snapshot.archive_filename
            );
        }

        let mut log = PipelineLog::new();
        match self.run_restore(request, &local_archive, progress, &mut log) {
            Ok(()) => Ok(()),
            Err(failure) => {
                self.restore_running(
                    &request.deployment,
                    &request.server,
                    failure.stage,
                    &mut log,
                );
                let _ = self.transport.exec(
                    &request.server,
                    &format!(
                        "rm -f {}",
                        shell_quote(&format!("/tmp/{}", request.snapshot.archive_filename))
                    ),
                );
                Err(anyhow::Error::new(PipelineError::new(
                    &request.deployment.id,
                    failure.stage,
                    log,
                    failure.source,
                )))
            }
        }
    }

    fn run_restore(
        &self,
        request: &RestoreRequest,
        local_archive: &std::path::Path,
        progress: &dyn ProgressSink,
        log: &mut PipelineLog,
    ) -> std::result::Result<(), StageFailure> {
        let deployment = &request.deployment;
        let server = &request.server;
        let remote_archive = format!("/tmp/{}", request.snapshot.archive_filename);

        report(progress, log, STAGE_STOP, 10, "stopping container");
        self.store
            .set_status(&deployment.id, DeploymentStatus::Restoring)
            .map_err(at(STAGE_STOP))?;
        self.stop_container(deployment, server, STAGE_STOP, log)
            .map_err(at(STAGE_STOP))?;

        report(progress, log, STAGE_UPLOAD, 35, "uploading archive");
        self.transport
            .upload(server, local_archive, &remote_archive)
            .map_err(at(STAGE_UPLOAD))?;

        // Root-rooted archive; extraction lands every member at its original
        // absolute path.
        report(progress, log, STAGE_EXTRACT, 65, "extracting volumes");
        exec_checked(
            self.transport.as_ref(),
            server,
            &format!("tar -xzf {} -C /", shell_quote(&remote_archive)),
        )
        .map_err(at(STAGE_EXTRACT))?;
        let _ = self.transport.exec(
            server,
            &format!("rm -f {}", shell_quote(&remote_archive)),
        );

        report(progress, log, STAGE_FINALIZE, 90, "restarting container");
        self.start_container(deployment, server, STAGE_FINALIZE, log)
            .map_err(at(STAGE_FINALIZE))?;
        self.store
            .set_status(&deployment.id, DeploymentStatus::Running)
            .map_err(at(STAGE_FINALIZE))?;
        report(progress, log, STAGE_FINALIZE, 100, "restore complete");
        Ok(())
    }

    /// Fail when the backup directory is already over quota (`required` = 0)
    /// or would go over by admitting an archive of `required` bytes. A zero
    /// quota disables the check.
    fn check_quota(&self, required: u64) -> Result<()> {
        let limit = self.config.backup_quota_bytes;
        if limit == 0 {
            return Ok(());
        }
        let used = directory_size_bytes(&self.config.backup_storage_path)
            .context("failed to measure backup storage usage")?;
        let exceeded = if required == 0 {
            used >= limit
        } else {
            used.saturating_add(required) > limit
        };
        if exceeded {
            return Err(anyhow::Error::new(QuotaError {
                used_bytes: used,
                limit_bytes: limit,
                required_bytes: required,
            }));
        }
        Ok(())
    }

    fn stop_container(
        &self,
        deployment: &Deployment,
        server: &Server,
        stage: &str,
        log: &mut PipelineLog,
    ) -> Result<()> {
        let result = self.transport.exec(
            server,
            &format!("docker stop {}", shell_quote(&deployment.container_name)),
        )?;
        if !result.success() {
            log.warn(
                stage,
                format!("docker stop exited {}: {}", result.exit_code, result.stderr.trim()),
            );
        }
        Ok(())
    }

    fn start_container(
        &self,
        deployment: &Deployment,
        server: &Server,
        stage: &str,
        log: &mut PipelineLog,
    ) -> Result<()> {
        let result = self.transport.exec(
            server,
            &format!("docker start {}", shell_quote(&deployment.container_name)),
        )?;
        if !result.success() {
            log.warn(
                stage,
                format!("docker start exited {}: {}", result.exit_code, result.stderr.trim()),
            );
        }
        Ok(())
    }

    /// Best-effort sweep of a failed snapshot's archives: the remote temp
    /// file, and the partial download in backup storage so a failed record
    /// never counts toward the quota.
    fn cleanup_archives(&self, server: &Server, archive_filename: &str) {
        let _ = self.transport.exec(
            server,
            &format!("rm -f {}", shell_quote(&format!("/tmp/{archive_filename}"))),
        );
        let local_archive = self.config.backup_storage_path.join(archive_filename);
        if local_archive.exists() {
            if let Err(err) = std::fs::remove_file(&local_archive) {
                tracing::warn!(
                    path = %local_archive.display(),
                    error = %err,
                    "failed to remove partial snapshot archive"
                );
            }
        }
    }

    /// Best-effort recovery after a failed pipeline: restart the container
    /// and put the stored status back to `running`. Never masks the original
    /// error.
    fn restore_running(
        &self,
        deployment: &Deployment,
        server: &Server,
        failed_stage: &str,
        log: &mut PipelineLog,
    ) {
        log.warn(failed_stage, "recovering: restarting container");
        match self.transport.exec(
            server,
            &format!("docker start {}", shell_quote(&deployment.container_name)),
        ) {
            Ok(result) if !result.success() => {
                tracing::warn!(
                    deployment_id = %deployment.id,
                    exit_code = result.exit_code,
                    "recovery docker start failed"
                );
                log.warn(
                    failed_stage,
                    format!("recovery docker start exited {}", result.exit_code),
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(deployment_id = %deployment.id, error = %err, "recovery transport failure");
                log.warn(failed_stage, format!("recovery transport failure: {err:#}"));
            }
        }
        if let Err(err) = self
            .store
            .set_status(&deployment.id, DeploymentStatus::Running)
        {
            tracing::warn!(deployment_id = %deployment.id, error = %err, "recovery status restore failed");
            log.warn(failed_stage, format!("recovery status restore failed: {err:#}"));
        }
    }
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
