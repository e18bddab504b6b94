//! Video4Linux camera backend
//!
//! Capture nodes are discovered through sysfs. Opening a camera takes an
//! exclusive advisory lock on its device node, which is how two ticketscan
//! processes (or anything else honouring `flock`) detect a busy camera.

use async_trait::async_trait;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::{
    pick_default, CameraBackend, CameraDevice, CaptureEnvironment, Constraints, FacingMode,
    OpenFailure, PermissionCallback, PermissionState, Track, TrackSettings,
};
use crate::error::CaptureError;
use crate::subscription::Subscription;

const SYSFS_VIDEO_ROOT: &str = "/sys/class/video4linux";
const DEV_ROOT: &str = "/dev";

#[derive(Debug, Clone)]
pub struct V4l2Backend {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl V4l2Backend {
    pub fn new() -> Self {
        Self::with_roots(SYSFS_VIDEO_ROOT, DEV_ROOT)
    }

    pub fn with_roots(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
        }
    }

    async fn devices(&self) -> Result<Vec<CameraDevice>, CaptureError> {
        let sysfs_root = self.sysfs_root.clone();
        let dev_root = self.dev_root.clone();
        tokio::task::spawn_blocking(move || scan_sysfs(&sysfs_root, &dev_root))
            .await
            .map_err(|e| CaptureError::HardwareUnavailable(format!("device scan task failed: {}", e)))?
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new()
    }
}

/// `video12` -> 12
fn device_number(name: &str) -> Option<u32> {
    name.strip_prefix("video")?.parse().ok()
}

fn read_attr(dir: &Path, attr: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
}

/// List capture nodes. Drivers expose metadata nodes with a non-zero
/// `index`; only index 0 carries the video stream.
fn scan_sysfs(sysfs_root: &Path, dev_root: &Path) -> Result<Vec<CameraDevice>, CaptureError> {
    let entries = match std::fs::read_dir(sysfs_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CaptureError::HardwareUnavailable(format!(
                "cannot read {}: {}",
                sysfs_root.display(),
                e
            )))
        }
    };

    let mut nodes: Vec<(u32, CameraDevice)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(number) = device_number(&name) else {
            continue;
        };

        let dir = entry.path();
        let index = read_attr(&dir, "index")
            .and_then(|i| i.parse::<u32>().ok())
            .unwrap_or(0);
        if index != 0 {
            tracing::debug!("Skipping {} (stream index {})", name, index);
            continue;
        }

        let label = read_attr(&dir, "name").unwrap_or_default();
        let id = dev_root.join(&name).display().to_string();
        nodes.push((number, CameraDevice::new(id, label)));
    }

    nodes.sort_by_key(|(number, _)| *number);
    Ok(nodes.into_iter().map(|(_, device)| device).collect())
}

fn access_state(path: &str) -> PermissionState {
    let Ok(c_path) = CString::new(Path::new(path).as_os_str().as_bytes()) else {
        return PermissionState::Unknown;
    };
    let rc = unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) };
    if rc == 0 {
        return PermissionState::Granted;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => PermissionState::Denied,
        _ => PermissionState::Unknown,
    }
}

fn open_error(device: &str, err: io::Error) -> CaptureError {
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => {
            CaptureError::Permission(format!("{}: {}", device, err))
        }
        Some(libc::EBUSY) => CaptureError::DeviceBusy(format!("{}: {}", device, err)),
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
            CaptureError::HardwareUnavailable(format!("{}: {}", device, err))
        }
        _ => CaptureError::HardwareUnavailable(format!("cannot open {}: {}", device, err)),
    }
}

fn open_locked(device: &str) -> Result<File, CaptureError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(device)
        .map_err(|e| open_error(device, e))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EBUSY => {
                CaptureError::DeviceBusy(format!("{} is in use by another process", device))
            }
            _ => open_error(device, err),
        });
    }
    Ok(file)
}

struct V4l2Track {
    id: String,
    settings: TrackSettings,
    file: Option<File>,
}

impl Track for V4l2Track {
    fn id(&self) -> &str {
        &self.id
    }

    fn settings(&self) -> TrackSettings {
        self.settings.clone()
    }

    fn stop(&mut self) {
        if let Some(file) = self.file.take() {
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
            tracing::debug!("Closed {}", self.settings.device_id);
        }
    }
}

impl Drop for V4l2Track {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl CameraBackend for V4l2Backend {
    fn environment(&self) -> CaptureEnvironment {
        // Local device access has no origin to secure.
        CaptureEnvironment {
            supports_capture: true,
            secure_context: true,
        }
    }

    async fn enumerate(&self) -> Result<Vec<CameraDevice>, CaptureError> {
        self.devices().await
    }

    async fn query_permission(&self) -> Option<PermissionState> {
        let devices = self.devices().await.ok()?;
        let states: Vec<PermissionState> = devices.iter().map(|d| access_state(&d.id)).collect();

        if states.contains(&PermissionState::Granted) {
            Some(PermissionState::Granted)
        } else if !states.is_empty() && states.iter().all(|s| *s == PermissionState::Denied) {
            Some(PermissionState::Denied)
        } else {
            Some(PermissionState::Unknown)
        }
    }

    fn watch_permission(&self, _on_change: PermissionCallback) -> Option<Subscription> {
        None
    }

    async fn open(&self, constraints: &Constraints) -> Result<Vec<Box<dyn Track>>, OpenFailure> {
        let devices = self.devices().await?;
        if devices.is_empty() {
            return Err(CaptureError::HardwareUnavailable("no video capture devices found".to_string()).into());
        }

        let device = match constraints.exact_device_id {
            Some(ref id) => devices.iter().find(|d| &d.id == id).ok_or_else(|| {
                CaptureError::Constraint(format!("device {} is not connected", id))
            })?,
            None if constraints.facing_mode == Some(FacingMode::Environment) => {
                pick_default(&devices).ok_or_else(|| CaptureError::HardwareUnavailable("no camera".to_string()))?
            }
            None => &devices[0],
        };

        let path = device.id.clone();
        let file = tokio::task::spawn_blocking(move || open_locked(&path))
            .await
            .map_err(|e| CaptureError::HardwareUnavailable(format!("open task failed: {}", e)))??;

        tracing::debug!("Opened {} ({})", device.id, device.label);

        // The node is held, not negotiated; report the requested format.
        let track = V4l2Track {
            id: uuid::Uuid::new_v4().to_string(),
            settings: TrackSettings {
                device_id: device.id.clone(),
                width: constraints.width.ideal,
                height: constraints.height.ideal,
                frame_rate: constraints.frame_rate.ideal,
            },
            file: Some(file),
        };
        Ok(vec![Box::new(track)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRoots {
        base: PathBuf,
    }

    impl FakeRoots {
        fn new() -> Self {
            let base = std::env::temp_dir().join(format!("ticketscan-v4l2-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(base.join("sys")).unwrap();
            std::fs::create_dir_all(base.join("dev")).unwrap();
            Self { base }
        }

        fn add_node(&self, node: &str, index: u32, name: &str) {
            let dir = self.base.join("sys").join(node);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("index"), format!("{}\n", index)).unwrap();
            std::fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
            std::fs::write(self.base.join("dev").join(node), b"").unwrap();
        }

        fn backend(&self) -> V4l2Backend {
            V4l2Backend::with_roots(self.base.join("sys"), self.base.join("dev"))
        }

        fn dev(&self, node: &str) -> String {
            self.base.join("dev").join(node).display().to_string()
        }
    }

    impl Drop for FakeRoots {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.base);
        }
    }

    #[test]
    fn test_device_number() {
        assert_eq!(device_number("video0"), Some(0));
        assert_eq!(device_number("video12"), Some(12));
        assert_eq!(device_number("vbi0"), None);
        assert_eq!(device_number("video"), None);
    }

    #[tokio::test]
    async fn test_enumerate_skips_metadata_nodes() {
        let roots = FakeRoots::new();
        roots.add_node("video10", 0, "USB Rear Camera");
        roots.add_node("video1", 1, "Integrated Camera");
        roots.add_node("video0", 0, "Integrated Camera");

        let devices = roots.backend().enumerate().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, roots.dev("video0"));
        assert_eq!(devices[0].label, "Integrated Camera");
        assert_eq!(devices[1].label, "USB Rear Camera");
    }

    #[tokio::test]
    async fn test_missing_sysfs_means_no_cameras() {
        let backend = V4l2Backend::with_roots("/nonexistent/video4linux", "/dev");
        assert!(backend.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_prefers_rear_and_locks_node() {
        let roots = FakeRoots::new();
        roots.add_node("video0", 0, "Integrated Camera");
        roots.add_node("video2", 0, "USB Rear Camera");
        let backend = roots.backend();

        let mut tracks = backend.open(&Constraints::default()).await.ok().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].settings().device_id, roots.dev("video2"));
        assert_eq!(tracks[0].settings().width, 1280);

        let second = backend
            .open(&Constraints::default().with_device(roots.dev("video2")))
            .await;
        assert!(matches!(second, Err(OpenFailure { error: CaptureError::DeviceBusy(_), .. })));

        tracks[0].stop();
        let mut reopened = backend
            .open(&Constraints::default().with_device(roots.dev("video2")))
            .await
            .ok()
            .unwrap();
        reopened[0].stop();
    }

    #[tokio::test]
    async fn test_open_unknown_exact_device_is_constraint_error() {
        let roots = FakeRoots::new();
        roots.add_node("video0", 0, "Integrated Camera");

        let result = roots
            .backend()
            .open(&Constraints::default().with_device("/dev/video9"))
            .await;
        assert!(matches!(result, Err(OpenFailure { error: CaptureError::Constraint(_), .. })));
    }

    #[tokio::test]
    async fn test_open_without_devices_is_hardware_unavailable() {
        let roots = FakeRoots::new();
        let result = roots.backend().open(&Constraints::default()).await;
        assert!(matches!(
            result,
            Err(OpenFailure { error: CaptureError::HardwareUnavailable(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_accessible_nodes_report_granted() {
        let roots = FakeRoots::new();
        roots.add_node("video0", 0, "Integrated Camera");
        assert_eq!(roots.backend().query_permission().await, Some(PermissionState::Granted));
    }
}
