//! Prints the GlusterCluster CRD as YAML.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > config/crd/glustercluster.yaml
//! ```

use crds::GlusterCluster;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&GlusterCluster::crd())?);
    Ok(())
}
