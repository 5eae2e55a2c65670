// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! View establishment.
//!
//! On every round start each replica sends its highest `prepareQC` to the
//! round's proposer. The proposer waits for a quorum of these, fixes the
//! highest certificate among them as the round's `highQC`, and is then
//! ready to propose.

use alloy_primitives::Address;
use tracing::{debug, trace, warn};

use bft_traits::{Backend, ConsensusError, Message, MsgType, NewViewMsg, QuorumCert};

use super::{Core, State};

impl<B: Backend> Core<B> {
    /// Announce the new view to its proposer. Replicas park in the
    /// `NewView` state afterwards; the proposer keeps accepting requests.
    pub(crate) async fn send_new_view(&mut self) {
        let Ok(current) = self.round() else {
            return;
        };
        let Some(prepare_qc) = current.prepare_qc().cloned() else {
            warn!("no prepare certificate to announce");
            return;
        };
        let data = NewViewMsg {
            view: current.view(),
            prepare_qc,
        };
        let val_set = current.val_set().clone();

        let mut msg = Message::new(MsgType::NewView, alloy_rlp::encode(&data).into());
        if let Err(err) = msg.sign(self.signer.as_ref()) {
            warn!(%err, "cannot sign the view announcement");
            return;
        }
        if let Err(err) = self.backend.unicast(&val_set, msg.payload()).await {
            warn!(%err, "cannot reach the proposer");
        }
        if !self.is_proposer() {
            self.set_state(State::NewView);
        }
    }

    /// Proposer side: collect announcements until quorum, then derive the
    /// high certificate.
    pub(crate) async fn handle_new_view(
        &mut self,
        msg: &Message,
        src: Address,
    ) -> Result<(), ConsensusError> {
        let data: NewViewMsg = msg.decode_data()?;
        self.check_view(data.view)?;
        if !self.is_proposer() {
            trace!(%src, "view announcement ignored, not leading this round");
            return Ok(());
        }
        if self.round()?.state() >= State::HighQC {
            trace!(%src, "late view announcement");
            return Ok(());
        }

        self.verify_qc(&data.prepare_qc)?;
        self.round_mut()?.add_new_view(msg.clone())?;

        let (size, quorum) = {
            let current = self.round()?;
            (current.new_view_size(), current.val_set().q())
        };
        debug!(%src, size, quorum, "view announcement collected");

        if size >= quorum {
            let high_qc = self.highest_announced_qc()?;
            debug!(view = %high_qc.view, "high certificate fixed");
            self.round_mut()?.set_high_qc(high_qc);
            self.set_state(State::HighQC);
            self.try_send_prepare().await?;
        }
        Ok(())
    }

    fn highest_announced_qc(&self) -> Result<QuorumCert, ConsensusError> {
        let mut highest: Option<QuorumCert> = None;
        for announcement in self.round()?.new_views() {
            let data: NewViewMsg = announcement.decode_data()?;
            if highest
                .as_ref()
                .map_or(true, |qc| data.prepare_qc.view > qc.view)
            {
                highest = Some(data.prepare_qc);
            }
        }
        highest.ok_or(ConsensusError::StateMismatch("no announcements collected"))
    }
}
