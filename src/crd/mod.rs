mod etcd;

pub use etcd::*;
