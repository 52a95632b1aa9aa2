//! Screen recording of a running build.
//!
//! Two phases coupled through [`RecordingConfig`]:
//!
//! ```text
//! capture (vncsnapshot, retried) ──► frames in <cache>/<os>/qemu-out-<slug>-vncsnapshot/
//!                                          │
//! encode  (ffmpeg, single run)   ◄─────────┘ ──► qemu.vnc.mp4, frames deleted
//! ```
//!
//! The capture connects to the build's VNC display, so it needs the display
//! password as a `vncpasswd`-obfuscated file. That file lives next to the
//! frames for the duration of the capture only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::paths::ProjectDirs;
use crate::process::{
    ProcessOverrides, ProcessRunConfig, RunOutcome, run_external_process, run_with_retries,
};
use crate::vm::VirtualMachineConfig;

pub const SNAPSHOT_FILE: &str = "qemu.vnc.jpg";
pub const PASSWORD_FILE: &str = ".packer-qemu.vnc.pass";
pub const VIDEO_FILE: &str = "qemu.vnc.mp4";

/// Shared state between the capture and encode phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingConfig {
    /// Frame file name template handed to the capture tool. The tool numbers
    /// frames as `<stem>NNNNN.<ext>`.
    pub output_file: Option<PathBuf>,
    pub output_folder: Option<PathBuf>,
    pub password: String,
}

impl RecordingConfig {
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..Self::default()
        }
    }
}

/// Whether this host can record builds at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingCapability {
    Supported,
    Unsupported,
}

impl RecordingCapability {
    /// Recording is only wired up for macOS build hosts.
    #[must_use]
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Self::Supported
        } else {
            Self::Unsupported
        }
    }
}

// ---------------------------------------------------------------------------
// Password encoding
// ---------------------------------------------------------------------------

/// Produces the contents of a VNC password file.
pub trait PasswordEncoder: Send + Sync {
    fn encode(&self, password: &str) -> std::io::Result<Vec<u8>>;
}

/// Delegates to `vncpasswd -f`, which reads the plain password on stdin and
/// writes the obfuscated form to stdout.
#[derive(Debug, Clone)]
pub struct VncPasswdCommand {
    pub executable: String,
}

impl Default for VncPasswdCommand {
    fn default() -> Self {
        Self {
            executable: "vncpasswd".to_string(),
        }
    }
}

impl PasswordEncoder for VncPasswdCommand {
    fn encode(&self, password: &str) -> std::io::Result<Vec<u8>> {
        use std::io::Write;
        use std::process::{Command, Stdio};

        let mut child = Command::new(&self.executable)
            .arg("-f")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes())?;
            stdin.write_all(b"\n")?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() || output.stdout.is_empty() {
            return Err(std::io::Error::other(format!(
                "{} -f exited with {}",
                self.executable, output.status
            )));
        }
        Ok(output.stdout)
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

pub struct Recorder {
    dirs: Arc<ProjectDirs>,
    capability: RecordingCapability,
    encoder: Arc<dyn PasswordEncoder>,
}

impl Recorder {
    /// Recorder for this host, encoding passwords with `vncpasswd`.
    #[must_use]
    pub fn new(dirs: Arc<ProjectDirs>) -> Self {
        Self {
            dirs,
            capability: RecordingCapability::detect(),
            encoder: Arc::new(VncPasswdCommand::default()),
        }
    }

    #[must_use]
    pub fn with_capability(mut self, capability: RecordingCapability) -> Self {
        self.capability = capability;
        self
    }

    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn PasswordEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    #[must_use]
    pub fn capability(&self) -> RecordingCapability {
        self.capability
    }

    /// `<cache>/<os>/qemu-out-<slug>-vncsnapshot`
    #[must_use]
    pub fn snapshot_dir(&self, vm: &VirtualMachineConfig) -> PathBuf {
        self.dirs
            .os_cache_dir(&vm.os)
            .join(format!("qemu-out-{}-vncsnapshot", vm.slug()))
    }

    /// Capture the build's VNC display as numbered frames until the capture
    /// tool exits or the retry budget runs out.
    ///
    /// Returns `Ok(None)` when nothing was attempted: unsupported host,
    /// capture tool not installed, or a port outside the VNC range.
    pub async fn capture(
        &self,
        vm: &VirtualMachineConfig,
        overrides: ProcessOverrides,
        recording: &mut RecordingConfig,
    ) -> Result<Option<RunOutcome>> {
        if self.capability == RecordingCapability::Unsupported {
            debug!(slug = vm.slug(), "Screen recording not supported on this host");
            return Ok(None);
        }

        let Some(vnc_display) = vm.vnc_display() else {
            warn!(slug = vm.slug(), port = vm.vnc_port, "Port is outside the VNC range, not recording");
            return Ok(None);
        };

        let folder = self.snapshot_dir(vm);
        let output_file = folder.join(SNAPSHOT_FILE);
        let password_file = folder.join(PASSWORD_FILE);

        let config = ProcessRunConfig::new("vncsnapshot")
            .args([
                "-quiet".to_string(),
                "-passwd".to_string(),
                password_file.display().to_string(),
                "-compresslevel".to_string(),
                "9".to_string(),
                "-count".to_string(),
                "21600".to_string(),
                "-fps".to_string(),
                "1".to_string(),
                format!("localhost:{vnc_display}"),
                output_file.display().to_string(),
            ])
            .working_dir(&self.dirs.project_dir)
            .timeout(Duration::from_secs(10 * 60))
            .retries(5, Duration::from_secs(60))
            .delay_before_start(Duration::from_secs(60))
            .label(format!("{}:vncsnapshot", vm.slug()))
            .with_overrides(overrides);

        if let Err(e) = which::which(&config.executable) {
            warn!(slug = vm.slug(), tool = %config.executable, error = %e, "Capture tool not found, not recording");
            return Ok(None);
        }

        reset_dir(&folder).await?;

        // The encode step only looks at folders recorded here, so nothing is
        // recorded until the capture can actually run.
        let result = match self.write_password(&password_file, &recording.password).await {
            Ok(()) => {
                recording.output_folder = Some(folder);
                recording.output_file = Some(output_file);
                info!(slug = vm.slug(), vnc_display, "Starting screen capture");
                Ok(run_with_retries(&config).await)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&password_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %password_file.display(), error = %e, "Failed to remove VNC password file");
            }
        }

        result.map(Some)
    }

    async fn write_password(&self, password_file: &Path, password: &str) -> Result<()> {
        let encoder = Arc::clone(&self.encoder);
        let password = password.to_string();
        let contents = tokio::task::spawn_blocking(move || encoder.encode(&password))
            .await
            .map_err(std::io::Error::other)??;
        write_private_file(password_file, &contents)?;
        Ok(())
    }

    /// Turn the captured frames into `qemu.vnc.mp4` and delete the frames.
    ///
    /// Returns `Ok(None)` when there is nothing to encode.
    pub async fn encode(
        &self,
        overrides: ProcessOverrides,
        recording: &RecordingConfig,
    ) -> Result<Option<RunOutcome>> {
        if self.capability == RecordingCapability::Unsupported {
            return Ok(None);
        }
        let Some(output_file) = &recording.output_file else {
            debug!("No capture output recorded, skipping video encode");
            return Ok(None);
        };
        let folder = recording
            .output_folder
            .clone()
            .or_else(|| output_file.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        let (stem, ext) = frame_name_parts(output_file);
        let pattern = folder.join(format!("{stem}%05d.{ext}"));

        let config = ProcessRunConfig::new("ffmpeg")
            .args([
                "-y".to_string(),
                "-framerate".to_string(),
                "1".to_string(),
                "-i".to_string(),
                pattern.display().to_string(),
                "-c:v".to_string(),
                "libx264".to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
                folder.join(VIDEO_FILE).display().to_string(),
            ])
            .working_dir(&self.dirs.project_dir)
            .timeout(Duration::from_secs(10 * 60))
            .label("ffmpeg")
            .with_overrides(overrides);

        if let Err(e) = which::which(&config.executable) {
            warn!(tool = %config.executable, error = %e, "Encoder not found, keeping captured frames");
            return Ok(None);
        }

        info!(folder = %folder.display(), "Encoding screen recording");
        let outcome = run_external_process(&config).await;
        match &outcome {
            Ok(RunOutcome::Completed) => {
                info!(video = %folder.join(VIDEO_FILE).display(), "Screen recording encoded");
            }
            Ok(other) => warn!(outcome = ?other, "Video encode did not complete"),
            Err(e) => warn!(error = %e, "Video encode failed"),
        }

        remove_frames(&folder, &stem, &ext).await;
        outcome.map(Some)
    }
}

/// `qemu.vnc.jpg` → (`qemu.vnc`, `jpg`).
fn frame_name_parts(output_file: &Path) -> (String, String) {
    let stem = output_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = output_file
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem, ext)
}

async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)
}

/// Delete every `<stem>*.<ext>` file in `folder`. Failures are logged only.
async fn remove_frames(folder: &Path, stem: &str, ext: &str) {
    let suffix = format!(".{ext}");
    let mut entries = match tokio::fs::read_dir(folder).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(folder = %folder.display(), error = %e, "Failed to list captured frames");
            return;
        }
    };

    let mut removed = 0usize;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(folder = %folder.display(), error = %e, "Failed to list captured frames");
                break;
            }
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(stem) && name.ends_with(&suffix)) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(frame = %entry.path().display(), error = %e, "Failed to remove captured frame"),
        }
    }
    info!(folder = %folder.display(), removed, "Removed captured frames");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEncoder;

    impl PasswordEncoder for FixedEncoder {
        fn encode(&self, password: &str) -> std::io::Result<Vec<u8>> {
            Ok(password.as_bytes().to_vec())
        }
    }

    fn recorder(root: &Path, capability: RecordingCapability) -> Recorder {
        Recorder::new(Arc::new(ProjectDirs::from_project_root(root)))
            .with_capability(capability)
            .with_encoder(Arc::new(FixedEncoder))
    }

    #[test]
    fn snapshot_dir_is_named_after_the_slug() {
        let recorder = recorder(Path::new("/work/dev-alchemy"), RecordingCapability::Supported);
        let vm = VirtualMachineConfig::new("ubuntu", "arm64").with_type("server");
        assert_eq!(
            recorder.snapshot_dir(&vm),
            PathBuf::from("/work/dev-alchemy/cache/ubuntu/qemu-out-ubuntu-server-arm64-vncsnapshot")
        );
    }

    #[test]
    fn frame_parts_split_stem_and_extension() {
        let (stem, ext) = frame_name_parts(Path::new("/tmp/x/qemu.vnc.jpg"));
        assert_eq!(stem, "qemu.vnc");
        assert_eq!(ext, "jpg");
    }

    #[tokio::test]
    async fn unsupported_host_touches_nothing() {
        let root = tempfile::tempdir().expect("tempdir");
        let recorder = recorder(root.path(), RecordingCapability::Unsupported);
        let vm = VirtualMachineConfig::new("ubuntu", "arm64").with_vnc_port(5901);
        let mut recording = RecordingConfig::new("packer");

        let outcome = recorder
            .capture(&vm, ProcessOverrides::default(), &mut recording)
            .await
            .expect("capture");
        assert_eq!(outcome, None);
        assert_eq!(recording, RecordingConfig::new("packer"));
        assert!(!root.path().join("cache").exists());

        let encoded = recorder.encode(ProcessOverrides::default(), &recording).await.expect("encode");
        assert_eq!(encoded, None);
    }

    #[tokio::test]
    async fn missing_capture_tool_is_skipped() {
        let root = tempfile::tempdir().expect("tempdir");
        let recorder = recorder(root.path(), RecordingCapability::Supported);
        let vm = VirtualMachineConfig::new("ubuntu", "arm64").with_vnc_port(5901);
        let mut recording = RecordingConfig::new("packer");
        let overrides = ProcessOverrides {
            executable: Some("definitely-not-a-vnc-tool-4f1c".to_string()),
            ..ProcessOverrides::default()
        };

        let outcome = recorder.capture(&vm, overrides, &mut recording).await.expect("capture");
        assert_eq!(outcome, None);
        assert!(recording.output_file.is_none());
    }

    struct BrokenEncoder;

    impl PasswordEncoder for BrokenEncoder {
        fn encode(&self, _password: &str) -> std::io::Result<Vec<u8>> {
            Err(std::io::Error::other("vncpasswd exited with status 1"))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn password_failure_leaves_nothing_to_encode() {
        let root = tempfile::tempdir().expect("tempdir");
        let recorder = recorder(root.path(), RecordingCapability::Supported)
            .with_encoder(Arc::new(BrokenEncoder));
        let vm = VirtualMachineConfig::new("ubuntu", "arm64").with_vnc_port(5901);
        let mut recording = RecordingConfig::new("packer");
        let overrides = ProcessOverrides {
            executable: Some("sh".to_string()),
            delay_before_start: Some(Duration::ZERO),
            ..ProcessOverrides::default()
        };

        let err = recorder
            .capture(&vm, overrides, &mut recording)
            .await
            .expect_err("password encoding fails");
        assert!(err.to_string().contains("vncpasswd"), "{err}");
        assert_eq!(recording, RecordingConfig::new("packer"));

        let encoded = recorder.encode(ProcessOverrides::default(), &recording).await.expect("encode");
        assert_eq!(encoded, None);
    }

    #[tokio::test]
    async fn encode_without_capture_output_is_a_no_op() {
        let root = tempfile::tempdir().expect("tempdir");
        let recorder = recorder(root.path(), RecordingCapability::Supported);
        let outcome = recorder
            .encode(ProcessOverrides::default(), &RecordingConfig::new("packer"))
            .await
            .expect("encode");
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn frame_cleanup_only_removes_matching_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["qemu.vnc00001.jpg", "qemu.vnc00002.jpg", "qemu.vnc.mp4", "notes.jpg"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }

        remove_frames(dir.path(), "qemu.vnc", "jpg").await;

        assert!(!dir.path().join("qemu.vnc00001.jpg").exists());
        assert!(!dir.path().join("qemu.vnc00002.jpg").exists());
        assert!(dir.path().join("qemu.vnc.mp4").exists());
        assert!(dir.path().join("notes.jpg").exists());
    }

    #[cfg(unix)]
    #[test]
    fn password_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(PASSWORD_FILE);
        write_private_file(&path, b"secret").expect("write");

        let mode = std::fs::metadata(&path).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).expect("read"), b"secret");
    }
}
