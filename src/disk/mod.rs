//! Disk and ISO image builder.
//!
//! Builds a bootable install image without root privileges or host tools:
//! the GPT, both FAT32 filesystems and the ISO9660 volume are written
//! directly into a sparse image file.
//!
//! The build is a fixed sequence of named steps over an [`ImageContext`]:
//!
//! | step                 | usb                         | iso                   |
//! |----------------------|-----------------------------|-----------------------|
//! | `validate`           | required node fields        | same                  |
//! | `stage-os-files`     | boot files + OS image       | same                  |
//! | `allocate`           | sparse image file           | same                  |
//! | `partition`          | GPT, read back and verified | (skipped)             |
//! | `create-filesystems` | FAT32 `ESP` + `FABINSTALL`  | ISO9660 spool         |
//! | `populate-boot`      | EFI/, images/, kernel, ...  | into the ISO root     |
//! | `populate-payload`   | OS image, staging tree, ign | into the ISO root     |
//! | `finalize`           | unmount, rename into place  | write volume, rename  |
//! | `cleanup`            | remove work + staging dirs  | same                  |
//!
//! The image is built under a temporary name; it only appears under its
//! final name after `finalize` succeeded.

pub mod fat;
pub mod gpt;
pub mod iso9660;
pub mod layout;
pub mod tree;

use crate::bootcfg::{BootConfigGenerator, BootConfigRequest, INSTALL_MEDIA_LABEL, INSTALL_MOUNT};
use crate::cache::{ArtifactCache, Cancel, FileSelector};
use crate::config::{ClusterConfig, NodeConfig, Versions, ART_OS_BOOT, ART_OS_IMAGE};
use crate::error::ConfigError;
use crate::fsutil;
use crate::gate::Fingerprint;
use crate::target::{BuildMode, BuildTarget, OutputLayout};
use anyhow::{bail, Context, Result};
use fat::{FatVolume, PartitionSlice};
use iso9660::{IsoOptions, IsoWriter};
use layout::{ImageGeometry, PartitionLayout};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tree::{copy_tree, TargetFs};

pub const EFI_DIR: &str = "EFI";
pub const IMAGES_DIR: &str = "images";
pub const KERNEL: &str = "vmlinuz";
pub const INITRD: &str = "initrd.img";
pub const OEM_FILE: &str = "oem.cfg";
pub const OS_IMAGE: &str = "os-image.bin.gz";
pub const EFI_BOOT_IMAGE: &str = "images/efiboot.img";
pub const IGNITION_FILE: &str = "ignition.json";
pub const ESP_LABEL: &str = "ESP";

const OEM_PAYLOAD: &[u8] = include_bytes!("../../assets/oem.cfg");

/// Everything an image build reads.
pub struct ImageRequest<'a> {
    pub target: &'a BuildTarget,
    pub layout: &'a OutputLayout,
    pub cluster: &'a ClusterConfig,
    pub node: &'a NodeConfig,
    pub versions: &'a Versions,
    pub geometry: ImageGeometry,
    pub fingerprint: &'a Fingerprint,
    pub cache: &'a ArtifactCache,
    pub boot_config: &'a dyn BootConfigGenerator,
    pub cancel: &'a Cancel,
}

/// State threaded through the image steps.
pub struct ImageContext<'a> {
    req: ImageRequest<'a>,
    work_dir: PathBuf,
    boot_dir: PathBuf,
    tmp_image: PathBuf,
    final_image: PathBuf,
    image: Option<File>,
    partitions: Option<PartitionLayout>,
    esp: Option<FatVolume>,
    data: Option<FatVolume>,
    iso: Option<IsoWriter>,
}

pub type Step = fn(&mut ImageContext<'_>) -> Result<()>;

impl<'a> ImageContext<'a> {
    pub fn new(req: ImageRequest<'a>) -> Result<Self> {
        let final_image = match req.target.mode {
            BuildMode::Usb => req.layout.usb_image(),
            BuildMode::Iso => req.layout.iso_image(),
            BuildMode::Manual => {
                return Err(ConfigError::Invalid(format!(
                    "{} is a manual build and has no disk image",
                    req.target
                ))
                .into())
            }
        };
        let work_dir = req.layout.work_dir();
        Ok(Self {
            boot_dir: work_dir.join("boot"),
            tmp_image: fsutil::tmp_sibling(&final_image),
            work_dir,
            final_image,
            image: None,
            partitions: None,
            esp: None,
            data: None,
            iso: None,
            req,
        })
    }

    fn mode(&self) -> BuildMode {
        self.req.target.mode
    }

    fn image_mut(&mut self) -> Result<&mut File> {
        self.image.as_mut().context("image file is not allocated")
    }

    /// Filesystem receiving the boot files.
    fn boot_fs(&mut self) -> Result<&mut dyn TargetFs> {
        match self.req.target.mode {
            BuildMode::Usb => self.esp.as_mut().map(|v| v as &mut dyn TargetFs),
            _ => self.iso.as_mut().map(|v| v as &mut dyn TargetFs),
        }
        .context("boot filesystem is not created")
    }

    /// Filesystem receiving the install payload.
    fn payload_fs(&mut self) -> Result<&mut dyn TargetFs> {
        match self.req.target.mode {
            BuildMode::Usb => self.data.as_mut().map(|v| v as &mut dyn TargetFs),
            _ => self.iso.as_mut().map(|v| v as &mut dyn TargetFs),
        }
        .context("payload filesystem is not created")
    }

    /// Drop open filesystems and the temporary image after a failed step.
    fn abort(&mut self) {
        self.esp = None;
        self.data = None;
        self.iso = None;
        self.image = None;
        if let Err(e) = fsutil::remove_path(&self.tmp_image) {
            warn!("Failed to remove {}: {e:#}", self.tmp_image.display());
        }
    }
}

/// Ordered steps for `mode`.
pub fn steps(mode: BuildMode) -> Result<Vec<(&'static str, Step)>> {
    let mut steps: Vec<(&'static str, Step)> = vec![
        ("validate", validate),
        ("stage-os-files", stage_os_files),
        ("allocate", allocate),
    ];
    match mode {
        BuildMode::Usb => steps.push(("partition", partition)),
        BuildMode::Iso => {}
        BuildMode::Manual => {
            return Err(ConfigError::Invalid("manual builds have no image steps".into()).into())
        }
    }
    steps.extend([
        ("create-filesystems", create_filesystems as Step),
        ("populate-boot", populate_boot),
        ("populate-payload", populate_payload),
        ("finalize", finalize),
        ("cleanup", cleanup),
    ]);
    Ok(steps)
}

/// Run every step for the request's mode and return the final image path.
pub fn build_image(req: ImageRequest<'_>) -> Result<PathBuf> {
    let target = req.target.clone();
    let mut ctx = ImageContext::new(req)?;
    for (name, step) in steps(target.mode)? {
        info!("[{target}] image step {name}");
        let result = ctx.req.cancel.check().map_err(anyhow::Error::from).and_then(|()| step(&mut ctx));
        if let Err(e) = result {
            ctx.abort();
            return Err(e.context(format!("image step `{name}` failed for {target}")));
        }
    }
    Ok(ctx.final_image)
}

fn validate(ctx: &mut ImageContext<'_>) -> Result<()> {
    let node = ctx.req.node;
    let required: [(&'static str, Option<&String>); 5] = [
        ("disk", node.disk.as_ref()),
        ("management.ip", node.management.ip.as_ref()),
        ("management.interface", node.management.interface.as_ref()),
        ("external.ip", node.external.ip.as_ref()),
        ("external.interface", node.external.interface.as_ref()),
    ];
    for (field, value) in required {
        if value.map_or(true, |v| v.trim().is_empty()) {
            return Err(ConfigError::MissingField {
                target: ctx.req.target.to_string(),
                field,
            }
            .into());
        }
    }
    Ok(())
}

fn stage_os_files(ctx: &mut ImageContext<'_>) -> Result<()> {
    fsutil::remove_path(&ctx.work_dir)?;
    fs::create_dir_all(&ctx.boot_dir)
        .with_context(|| format!("Failed to create {}", ctx.boot_dir.display()))?;

    let os_boot = ctx.req.versions.artifact(ART_OS_BOOT)?;
    ctx.req.cache.copy_into(
        &ctx.boot_dir,
        &os_boot,
        &[
            FileSelector::file(EFI_DIR),
            FileSelector::file(IMAGES_DIR),
            FileSelector::file(KERNEL),
            FileSelector::file(INITRD),
        ],
        ctx.req.cancel,
    )?;

    let os_image = ctx.req.versions.artifact(ART_OS_IMAGE)?;
    ctx.req.cache.copy_into(
        &ctx.work_dir,
        &os_image,
        &[FileSelector::file(OS_IMAGE)],
        ctx.req.cancel,
    )?;

    fs::write(ctx.boot_dir.join(OEM_FILE), OEM_PAYLOAD)?;
    Ok(())
}

fn allocate(ctx: &mut ImageContext<'_>) -> Result<()> {
    let total = ctx.req.geometry.total_bytes();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&ctx.tmp_image)
        .with_context(|| format!("Failed to create {}", ctx.tmp_image.display()))?;
    file.set_len(total)
        .with_context(|| format!("Failed to size {} to {total} bytes", ctx.tmp_image.display()))?;
    debug!("Allocated {} bytes (sparse) at {}", total, ctx.tmp_image.display());
    ctx.image = Some(file);
    Ok(())
}

fn partition(ctx: &mut ImageContext<'_>) -> Result<()> {
    let layout = PartitionLayout::compute(&ctx.req.geometry, &ctx.req.fingerprint.bytes());
    let file = ctx.image_mut()?;
    gpt::write(file, &layout)?;
    file.sync_all()?;
    gpt::verify(file, &layout)?;
    for p in &layout.partitions {
        debug!(
            "Partition {}: LBA {}-{} ({} bytes)",
            p.name,
            p.first_lba,
            p.last_lba,
            p.size_bytes()
        );
    }
    ctx.partitions = Some(layout);
    Ok(())
}

fn create_filesystems(ctx: &mut ImageContext<'_>) -> Result<()> {
    match ctx.mode() {
        BuildMode::Usb => {
            let parts = ctx
                .partitions
                .as_ref()
                .context("partition table is not written")?;
            let file = ctx.image.as_ref().context("image file is not allocated")?;
            let seed = ctx.req.fingerprint.bytes();
            let volume_id = u32::from_le_bytes([seed[0], seed[1], seed[2], seed[3]]);

            let esp = parts.esp();
            ctx.esp = Some(FatVolume::format(
                PartitionSlice::new(file.try_clone()?, esp.offset_bytes(), esp.size_bytes()),
                ESP_LABEL,
                volume_id,
            )?);
            let data = parts.data();
            ctx.data = Some(FatVolume::format(
                PartitionSlice::new(file.try_clone()?, data.offset_bytes(), data.size_bytes()),
                INSTALL_MEDIA_LABEL,
                volume_id.wrapping_add(1),
            )?);
        }
        BuildMode::Iso => {
            ctx.iso = Some(IsoWriter::new(&ctx.work_dir.join("iso"))?);
        }
        BuildMode::Manual => bail!("manual builds have no filesystems"),
    }
    Ok(())
}

fn populate_boot(ctx: &mut ImageContext<'_>) -> Result<()> {
    let boot_dir = ctx.boot_dir.clone();
    let fs = ctx.boot_fs()?;
    copy_tree(&boot_dir.join(EFI_DIR), fs, EFI_DIR)?;
    copy_tree(&boot_dir.join(IMAGES_DIR), fs, IMAGES_DIR)?;
    for file in [KERNEL, INITRD, OEM_FILE] {
        copy_tree(&boot_dir.join(file), fs, "")?;
    }
    Ok(())
}

fn populate_payload(ctx: &mut ImageContext<'_>) -> Result<()> {
    let stem = ctx.req.layout.stem().to_string();
    let staging = ctx.req.layout.staging_dir();
    let os_image = ctx.work_dir.join(OS_IMAGE);
    let ignition = ctx.req.boot_config.generate(&BootConfigRequest {
        cluster: ctx.req.cluster,
        node: ctx.req.node,
        auto_install: Some(format!("{INSTALL_MOUNT}/{stem}")),
    })?;

    let fs = ctx.payload_fs()?;
    copy_tree(&os_image, fs, "")?;
    let stats = copy_tree(&staging, fs, &stem)
        .with_context(|| format!("Failed to copy {}", staging.display()))?;
    let mut out = fs.create_file(IGNITION_FILE)?;
    out.write_all(&ignition)?;
    out.flush()?;
    debug!(
        "Copied {} files, {} directories, {} bytes of payload",
        stats.files, stats.dirs, stats.bytes
    );
    Ok(())
}

fn finalize(ctx: &mut ImageContext<'_>) -> Result<()> {
    match ctx.mode() {
        BuildMode::Usb => {
            if let Some(esp) = ctx.esp.take() {
                esp.unmount().context("Failed to commit ESP")?;
            }
            if let Some(data) = ctx.data.take() {
                data.unmount().context("Failed to commit install partition")?;
            }
        }
        BuildMode::Iso => {
            let iso = ctx.iso.take().context("ISO filesystem is not created")?;
            let volume_blocks = ctx.req.geometry.total_bytes() / iso9660::BLOCK_SIZE;
            let file = ctx.image_mut()?;
            let summary = iso.finalize(
                file,
                &IsoOptions {
                    volume_id: INSTALL_MEDIA_LABEL,
                    boot_image: Some(EFI_BOOT_IMAGE),
                    volume_blocks,
                },
            )?;
            debug!("ISO uses {} blocks", summary.used_blocks);
        }
        BuildMode::Manual => bail!("manual builds have no image"),
    }

    let file = ctx.image.take().context("image file is not allocated")?;
    file.sync_all()?;
    drop(file);
    fsutil::commit(&ctx.tmp_image, &ctx.final_image)?;
    info!("Wrote {}", ctx.final_image.display());
    Ok(())
}

fn cleanup(ctx: &mut ImageContext<'_>) -> Result<()> {
    for dir in [ctx.work_dir.clone(), ctx.req.layout.staging_dir()] {
        if let Err(e) = fsutil::remove_path(&dir) {
            warn!("Failed to remove {}: {e:#}", dir.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::iso9660::reader::Volume;
    use super::layout::MIB;
    use super::*;
    use crate::bootcfg::IgnitionGenerator;
    use crate::config::{BuilderConfig, FabConfig};
    use crate::error::{classify, FailureKind};
    use crate::target::NodeKind;
    use crate::testutil::{FakeRegistry, FAB_YAML};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Env {
        tmp: TempDir,
        fab: FabConfig,
        versions: Versions,
        cache: ArtifactCache,
        fingerprint: Fingerprint,
    }

    fn env() -> Env {
        env_with(FakeRegistry::complete())
    }

    fn env_with(registry: FakeRegistry) -> Env {
        let tmp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(&tmp.path().join("cache"), Arc::new(registry)).unwrap();
        let fab = FabConfig::from_yaml(FAB_YAML).unwrap();
        let versions = BuilderConfig::default().versions();
        let fingerprint = crate::gate::fingerprint(&crate::gate::FingerprintInputs {
            tool_version: "test",
            fab: &fab,
            node: &fab.control[0],
            wiring: &Default::default(),
            versions: &versions,
            image: &Default::default(),
            mode: BuildMode::Iso,
        })
        .unwrap();
        Env {
            tmp,
            fab,
            versions,
            cache,
            fingerprint,
        }
    }

    fn run(env: &Env, target: &BuildTarget, node: &NodeConfig) -> Result<PathBuf> {
        let out = env.tmp.path().join("out");
        let layout = target.layout(&out);
        let staging = layout.staging_dir();
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("install.yaml"), "kind: control\n").unwrap();
        build_image(ImageRequest {
            target,
            layout: &layout,
            cluster: &env.fab.cluster,
            node,
            versions: &env.versions,
            geometry: ImageGeometry::new(36 * MIB, 36 * MIB).unwrap(),
            fingerprint: &env.fingerprint,
            cache: &env.cache,
            boot_config: &IgnitionGenerator,
            cancel: &Cancel::new(),
        })
    }

    #[test]
    fn step_order() {
        let names = |mode| {
            steps(mode)
                .unwrap()
                .into_iter()
                .map(|(n, _)| n)
                .collect::<Vec<_>>()
        };
        assert_eq!(
            names(BuildMode::Usb),
            vec![
                "validate",
                "stage-os-files",
                "allocate",
                "partition",
                "create-filesystems",
                "populate-boot",
                "populate-payload",
                "finalize",
                "cleanup"
            ]
        );
        assert!(!names(BuildMode::Iso).contains(&"partition"));
        assert!(steps(BuildMode::Manual).is_err());
    }

    #[test]
    fn missing_node_field_is_named() {
        let env = env();
        let target = BuildTarget::new(NodeKind::Control, "node-a", BuildMode::Usb).unwrap();
        let mut node = env.fab.control[0].clone();
        node.external.interface = None;

        let err = run(&env, &target, &node).unwrap_err();
        assert_eq!(classify(&err), FailureKind::Configuration);
        let msg = format!("{err:#}");
        assert!(msg.contains("external.interface"), "{msg}");
        assert!(msg.contains("validate"), "{msg}");
        assert!(!target.layout(&env.tmp.path().join("out")).usb_image().exists());
    }

    #[test]
    fn iso_image_end_to_end() {
        let env = env();
        let target = BuildTarget::new(NodeKind::Control, "node-a", BuildMode::Iso).unwrap();
        let path = run(&env, &target, &env.fab.control[0]).unwrap();
        let layout = target.layout(&env.tmp.path().join("out"));

        assert_eq!(path, layout.iso_image());
        let geometry = ImageGeometry::new(36 * MIB, 36 * MIB).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), geometry.total_bytes());
        assert!(!layout.work_dir().exists());
        assert!(!layout.staging_dir().exists());

        let image = fs::read(&path).unwrap();
        let vol = Volume::new(&image);
        assert_eq!(vol.volume_id(), "FABINSTALL");
        assert_eq!(
            u64::from(vol.volume_blocks()),
            geometry.total_bytes() / iso9660::BLOCK_SIZE
        );
        let (files, dirs) = vol.walk();
        assert!(dirs.contains(&"EFI/BOOT".to_string()));
        assert_eq!(files["EFI/BOOT/BOOTX64.EFI"], b"shim");
        assert_eq!(files["vmlinuz"], b"kernel");
        assert_eq!(files["oem.cfg"], OEM_PAYLOAD);
        assert_eq!(files["os-image.bin.gz"], b"base os image");
        assert_eq!(files["control--node-a--install/install.yaml"], b"kind: control\n");

        let ign: serde_json::Value = serde_json::from_slice(&files["ignition.json"]).unwrap();
        let units = ign["systemd"]["units"].as_array().unwrap();
        assert!(units[1]["contents"]
            .as_str()
            .unwrap()
            .contains("/mnt/fab-install/control--node-a--install/fab-installer install"));
    }

    #[test]
    fn missing_boot_image_aborts_without_output() {
        let env = env_with(
            FakeRegistry::new()
                .with_file(ART_OS_BOOT, "EFI/BOOT/BOOTX64.EFI", b"shim")
                .with_file(ART_OS_BOOT, "images/readme.txt", b"no boot image here")
                .with_file(ART_OS_BOOT, "vmlinuz", b"kernel")
                .with_file(ART_OS_BOOT, "initrd.img", b"initrd")
                .with_file(ART_OS_IMAGE, "os-image.bin.gz", b"base"),
        );
        let target = BuildTarget::new(NodeKind::Control, "node-a", BuildMode::Iso).unwrap();
        let err = run(&env, &target, &env.fab.control[0]).unwrap_err();
        assert_eq!(classify(&err), FailureKind::Integrity);
        assert!(format!("{err:#}").contains("finalize"));

        let out = env.tmp.path().join("out");
        let leftovers: Vec<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".iso"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
