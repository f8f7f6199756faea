use anyhow::Result;
use kube::CustomResourceExt;

use tekton_pruner_gc::crd::PrunerConfig;

/// Print the PrunerConfig CRD YAML to stdout for `kubectl apply -f`.
///
/// PipelineRun/TaskRun are not generated here: they are Tekton's own CRDs,
/// assumed already installed in the cluster.
pub fn generate() -> Result<()> {
    let crd = PrunerConfig::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{yaml}");
    Ok(())
}

/// Apply the PrunerConfig CRD directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    let crd = PrunerConfig::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    match crds.create(&Default::default(), &crd).await {
        Ok(_) => {
            println!("CRD '{name}' installed successfully");
        }
        Err(kube::Error::Api(err)) if err.code == 409 => {
            println!("CRD '{name}' already exists -- skipping");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
