//! Prints the CRD manifests owned by the vSphere controllers as a
//! multi-document YAML stream.

use crds::{VSphereCluster, VSphereClusterIdentity, VSphereDeploymentZone, VSphereMachine, VSphereVM};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        VSphereCluster::crd(),
        VSphereVM::crd(),
        VSphereMachine::crd(),
        VSphereDeploymentZone::crd(),
        VSphereClusterIdentity::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
