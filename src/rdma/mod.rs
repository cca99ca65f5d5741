// RDMA contexts.
pub mod context;

// RDMA completion queues.
pub mod cq;

// Device GIDs.
pub mod gid;

// Local RDMA memory regions, remote memory handles and slices.
pub mod mr;

// RDMA hardware resource discovery (devices, ports).
pub mod nic;

// RDMA protection domains.
pub mod pd;

// RDMA queue pairs.
pub mod qp;

// Type aliases shared across RDMA-related operations.
pub mod type_alias;

// RDMA work requests.
pub mod wr;
