// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mfgtool::{
    sign, validate, Definition, MfgBuilder, MfgEmitter, MfgImage, Project,
};

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "build factory flash images")]
struct Args {
    /// Project root, holding `project.toml` and `mfgs/`.
    #[clap(short, long, default_value = ".")]
    project: PathBuf,
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Builds an mfg image and writes it to `target/mfgs/<name>/`.
    Create {
        /// Name of the directory under `mfgs/` holding `mfg.toml`.
        name: String,
        /// Version string recorded in the manifest.
        version: String,
        /// PKCS#8 PEM P-256 key to sign the mfg hash with. May be repeated.
        #[clap(short, long)]
        key: Vec<PathBuf>,
    },
    /// Re-checks the hashes of an already emitted mfg image.
    Validate {
        /// Name of the mfg image; ignored if `--dir` is given.
        #[clap(required_unless_present = "dir")]
        name: Option<String>,
        /// Output directory to check directly.
        #[clap(long)]
        dir: Option<PathBuf>,
    },
    /// Resolves a definition and prints its layout without writing anything.
    Show {
        name: String,
    },
}

fn build(project: &Project, name: &str) -> Result<MfgImage> {
    let def = Definition::from_file(&project.definition_path(name))?;
    MfgBuilder::new(project).build(&def)
}

fn print_layout(image: &MfgImage) {
    let mut device = None;
    for p in image.parts() {
        if device != Some(p.device) {
            println!("device {}:", p.device);
            device = Some(p.device);
        }
        println!("  {:#010x}..{:#010x}  {}", p.offset, p.end(), p.name);
    }
    for s in &image.sections {
        let name = format!("dev{}", s.device);
        println!("{:<5} = {:#010x}..{:#010x}", name, s.base, s.end());
    }
    println!("mfg hash: {}", hex::encode(image.hash));
}

fn create(
    project: &Path,
    name: &str,
    version: &str,
    keys: &[PathBuf],
) -> Result<()> {
    let project = Project::load(project)?;
    let keys = keys
        .iter()
        .map(|k| sign::load_key(k))
        .collect::<Result<Vec<_>>>()?;

    let image = build(&project, name)?;
    let out = project.out_dir(name);
    MfgEmitter::new(&image, &out, version)
        .with_keys(keys)
        .emit()
        .with_context(|| format!("could not emit {}", out.display()))?;
    print_layout(&image);
    Ok(())
}

fn main() -> Result<()> {
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");

    env_logger::init_from_env(env);

    let args = Args::parse();
    match args.cmd {
        Cmd::Create { name, version, key } => {
            create(&args.project, &name, &version, &key)?;
        }
        Cmd::Validate { name, dir } => {
            let dir = match (dir, name) {
                (Some(dir), _) => dir,
                (None, Some(name)) => {
                    Project::load(&args.project)?.out_dir(&name)
                }
                (None, None) => unreachable!("clap requires one of them"),
            };
            let hash = validate::run(&dir)?;
            println!("{}: ok, mfg hash {}", dir.display(), hex::encode(hash));
        }
        Cmd::Show { name } => {
            let project = Project::load(&args.project)?;
            print_layout(&build(&project, &name)?);
        }
    }

    Ok(())
}
