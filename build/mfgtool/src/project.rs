// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The project: which BSPs and built targets exist, and where their
//! artifacts live. Loaded once and then only read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{suggest, MfgError};
use crate::flash::FlashMap;

pub const PROJECT_FILE: &str = "project.toml";
pub const DEFINITION_FILE: &str = "mfg.toml";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawProject {
    #[serde(default)]
    bsps: IndexMap<String, RawBsp>,
    #[serde(default)]
    targets: IndexMap<String, RawTarget>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawBsp {
    flash_map: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawTarget {
    bsp: String,
    dir: PathBuf,
    bin: Option<PathBuf>,
    image: Option<PathBuf>,
    elf: Option<PathBuf>,
    manifest: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct Bsp {
    pub name: String,
    pub flash_map: FlashMap,
}

/// Paths to everything the external build produced for one target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetArtifacts {
    pub name: String,
    pub bsp: String,
    /// Stripped application binary; what a bootloader is flashed as.
    pub bin: PathBuf,
    /// Signed image; what everything else is flashed as.
    pub image: PathBuf,
    pub elf: PathBuf,
    pub manifest: PathBuf,
}

impl TargetArtifacts {
    /// Artifacts laid out the way the target build writes them.
    pub fn in_dir(name: &str, bsp: &str, dir: &Path) -> Self {
        Self {
            name: name.to_string(),
            bsp: bsp.to_string(),
            bin: dir.join("app.bin"),
            image: dir.join("app.img"),
            elf: dir.join("app.elf"),
            manifest: dir.join("manifest.json"),
        }
    }
}

/// The subset of a target's build manifest that we care about.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TargetManifest {
    #[serde(default)]
    pub syscfg: BTreeMap<String, serde_json::Value>,
}

impl TargetManifest {
    /// Whether the target was built as a bootloader (`BOOT_LOADER` set).
    pub fn is_boot(&self) -> bool {
        use serde_json::Value;
        match self.syscfg.get("BOOT_LOADER") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_u64().map_or(false, |n| n != 0),
            Some(Value::String(s)) => {
                matches!(s.trim(), "1" | "true" | "yes")
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Project {
    pub root: PathBuf,
    bsps: IndexMap<String, Bsp>,
    targets: IndexMap<String, TargetArtifacts>,
}

impl Project {
    /// Loads `project.toml` from `root`, along with every BSP's flash map.
    pub fn load(root: &Path) -> Result<Self> {
        let file = root.join(PROJECT_FILE);
        let text = std::fs::read_to_string(&file).with_context(|| {
            format!("could not read project file {}", file.display())
        })?;
        let raw: RawProject = toml::from_str(&text)
            .with_context(|| format!("could not parse {}", file.display()))?;

        let mut bsps = IndexMap::new();
        for (name, b) in raw.bsps {
            let flash_map = FlashMap::from_file(&root.join(&b.flash_map))
                .with_context(|| format!("loading BSP {}", name))?;
            log::debug!("bsp {}: {} flash areas", name, flash_map.len());
            bsps.insert(name.clone(), Bsp { name, flash_map });
        }

        let mut targets = IndexMap::new();
        for (name, t) in raw.targets {
            let dir = root.join(&t.dir);
            let mut a = TargetArtifacts::in_dir(&name, &t.bsp, &dir);
            if let Some(p) = t.bin {
                a.bin = dir.join(p);
            }
            if let Some(p) = t.image {
                a.image = dir.join(p);
            }
            if let Some(p) = t.elf {
                a.elf = dir.join(p);
            }
            if let Some(p) = t.manifest {
                a.manifest = dir.join(p);
            }
            targets.insert(name, a);
        }

        Ok(Self {
            root: root.to_path_buf(),
            bsps,
            targets,
        })
    }

    pub fn target(&self, name: &str) -> Result<&TargetArtifacts> {
        self.targets.get(name).ok_or_else(|| {
            MfgError::UndefinedTarget {
                name: name.to_string(),
                suggestion: suggest(
                    name,
                    self.targets.keys().map(|k| k.as_str()),
                ),
            }
            .into()
        })
    }

    pub fn bsp(&self, name: &str) -> Result<&Bsp> {
        self.bsps.get(name).ok_or_else(|| {
            MfgError::UndefinedBsp {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn definition_path(&self, mfg: &str) -> PathBuf {
        self.root.join("mfgs").join(mfg).join(DEFINITION_FILE)
    }

    /// Where a built mfg image and its manifest are written.
    pub fn out_dir(&self, mfg: &str) -> PathBuf {
        self.root.join("target").join("mfgs").join(mfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn boot_flag() {
        let m: TargetManifest = serde_json::from_str(
            r#"{"name": "boot", "syscfg": {"BOOT_LOADER": "1", "X": "0"}}"#,
        )
        .unwrap();
        assert!(m.is_boot());

        let m: TargetManifest =
            serde_json::from_str(r#"{"syscfg": {"BOOT_LOADER": "0"}}"#)
                .unwrap();
        assert!(!m.is_boot());

        let m: TargetManifest =
            serde_json::from_str(r#"{"syscfg": {"BOOT_LOADER": 1}}"#).unwrap();
        assert!(m.is_boot());

        let m: TargetManifest = serde_json::from_str("{}").unwrap();
        assert!(!m.is_boot());
    }

    #[test]
    fn load_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bsp")).unwrap();
        std::fs::write(
            dir.path().join("bsp/flash_map.toml"),
            indoc! {r#"
                [areas.FLASH_AREA_BOOTLOADER]
                device = 0
                offset = 0
                size = "16kB"
            "#},
        )
        .unwrap();
        std::fs::write(
            dir.path().join(PROJECT_FILE),
            indoc! {r#"
                [bsps.board]
                flash-map = "bsp/flash_map.toml"

                [targets.boot]
                bsp = "board"
                dir = "bin/boot"
                bin = "boot.bin"
            "#},
        )
        .unwrap();

        let p = Project::load(dir.path()).unwrap();
        let boot = p.target("boot").unwrap();
        assert_eq!(boot.bin, dir.path().join("bin/boot/boot.bin"));
        assert_eq!(boot.elf, dir.path().join("bin/boot/app.elf"));
        assert_eq!(p.bsp("board").unwrap().flash_map.len(), 1);

        let err = p.target("bot").unwrap_err();
        assert_eq!(
            err.downcast_ref::<MfgError>(),
            Some(&MfgError::UndefinedTarget {
                name: "bot".into(),
                suggestion: Some("boot".into()),
            })
        );
        assert!(matches!(
            p.bsp("nope").unwrap_err().downcast_ref::<MfgError>(),
            Some(MfgError::UndefinedBsp { .. })
        ));
        assert_eq!(
            p.out_dir("factory"),
            dir.path().join("target/mfgs/factory")
        );
    }
}
