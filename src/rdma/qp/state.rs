use crate::bindings::*;

/// Queue pair state, mirroring `ibv_qp_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    SqD,
    SqE,
    Err,
    Unknown,
}

impl From<ibv_qp_state::Type> for QpState {
    fn from(state: ibv_qp_state::Type) -> Self {
        match state {
            ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QpState::Init,
            ibv_qp_state::IBV_QPS_RTR => QpState::Rtr,
            ibv_qp_state::IBV_QPS_RTS => QpState::Rts,
            ibv_qp_state::IBV_QPS_SQD => QpState::SqD,
            ibv_qp_state::IBV_QPS_SQE => QpState::SqE,
            ibv_qp_state::IBV_QPS_ERR => QpState::Err,
            _ => QpState::Unknown,
        }
    }
}
