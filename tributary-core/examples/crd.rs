//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use tributary_core::crd::Source;

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("k8s").join("crds");
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating CRD dir {:?}", &crds_path))?;

    let source = Source::crd();
    let source_yaml = serde_yaml::to_string(&source).context("error serializing Source CRD to yaml")?;
    std::fs::write(crds_path.join("source.yaml"), &source_yaml).with_context(|| format!("error writing Source CRD to {:?}", &crds_path))?;
    println!("Source CRD written to {:?}", &crds_path);

    Ok(())
}
