use kube::CustomResourceExt;
use naptime::model::SleepSchedule;

fn main() {
    print!("{}", serde_yaml::to_string(&SleepSchedule::crd()).unwrap());
}
