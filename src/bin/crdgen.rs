//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the BackupPolicy
//! resource defined by the workload-backup-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/backuppolicy.yaml

use workload_backup_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
