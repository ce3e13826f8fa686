mod flow;
pub mod tables;

pub mod observer {
    pub mod v1 {
        tonic::include_proto!("observer.v1");
    }
}

pub mod agent {
    pub mod v1 {
        tonic::include_proto!("agent.v1");
    }
}
