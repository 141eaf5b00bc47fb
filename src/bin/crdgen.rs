use kube::CustomResourceExt;
use astarte_k8s::crd::Astarte;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Astarte::crd())?);
    Ok(())
}
