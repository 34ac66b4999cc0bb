use kube::CustomResourceExt;
use tunnel_operator::ops::Tunnel;

fn main() {
    println!("{}", serde_yaml::to_string(&Tunnel::crd()).unwrap());
}
