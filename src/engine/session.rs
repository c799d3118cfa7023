//! One AMQP session: sliding-window accounting and its link table.

use std::collections::HashMap;

use super::{
    EngineContext,
    link::{Link, LinkEnv},
};
use crate::{
    codec::{Attach, Begin, Flow, Role},
    error::ErrorCondition,
    transport::{Capabilities, RouteId, TraceId},
};

/// Session-level sliding-window counters.
///
/// Windows count TRANSFER frames; the remote values are signed so a
/// misbehaving peer shows up as an exhausted window instead of a
/// wrapped one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SessionWindows {
    pub(crate) next_incoming_id: u32,
    pub(crate) incoming_window: u32,
    pub(crate) next_outgoing_id: u32,
    pub(crate) outgoing_window: u32,
    pub(crate) remote_incoming_window: i64,
    pub(crate) remote_outgoing_window: i64,
}

/// One AMQP channel within a connection.
#[derive(Debug)]
pub(crate) struct Session {
    channel_id: u16,
    pub(crate) windows: SessionWindows,
    pub(crate) links: HashMap<u32, Link>,
}

impl Session {
    /// Seed a session from the peer's BEGIN.
    ///
    /// Our incoming window is the reassembly slot capacity; the
    /// outgoing window is configured. `next_outgoing_id` starts at one
    /// because the answering BEGIN occupies position zero.
    pub(crate) fn new(
        channel_id: u16,
        begin: &Begin,
        incoming_window: u32,
        outgoing_window: u32,
    ) -> Self {
        Self {
            channel_id,
            windows: SessionWindows {
                next_incoming_id: begin.next_outgoing_id,
                incoming_window,
                next_outgoing_id: 1,
                outgoing_window,
                remote_incoming_window: i64::from(begin.incoming_window),
                remote_outgoing_window: i64::from(begin.outgoing_window),
            },
            links: HashMap::new(),
        }
    }

    pub(crate) const fn channel_id(&self) -> u16 { self.channel_id }

    /// Attach a link on this session.
    ///
    /// Re-attaching an in-use handle is NOT_ALLOWED. An address with no
    /// route is ignored: no link is created and the peer learns nothing,
    /// matching the bridge's lookup-or-nothing routing contract.
    pub(crate) fn on_decode_attach(
        &mut self,
        ctx: &mut EngineContext<'_>,
        env: LinkEnv,
        attach: &Attach,
        trace_id: TraceId,
        authorization: u64,
        network_route: RouteId,
    ) -> Result<(), ErrorCondition> {
        if self.links.contains_key(&attach.handle) {
            return Err(ErrorCondition::NotAllowed);
        }

        let capabilities = Capabilities::from_role(attach.role);
        let address = match attach.role {
            Role::Receiver => attach.source.as_ref().and_then(|s| s.address.as_deref()),
            Role::Sender => attach.target.as_ref().and_then(|t| t.address.as_deref()),
        };

        let Some(route) =
            ctx.router
                .resolve(network_route, authorization, address, capabilities)
        else {
            tracing::debug!(
                channel = self.channel_id,
                handle = attach.handle,
                ?address,
                "no route for attach"
            );
            return Ok(());
        };

        let link = Link::open(ctx, env, attach, route, trace_id, authorization);
        self.links.insert(attach.handle, link);
        Ok(())
    }

    /// Session-scope FLOW: recompute windows, then forward link fields.
    ///
    /// `remote_incoming_window = peer.next_incoming_id +
    /// peer.incoming_window - next_outgoing_id(self)`, recomputed on
    /// every FLOW. A handle must travel with delivery-count and
    /// link-credit or the frame is malformed.
    pub(crate) fn on_decode_flow(
        &mut self,
        ctx: &mut EngineContext<'_>,
        flow: &Flow,
        trace_id: TraceId,
        authorization: u64,
        max_frame_size: u32,
        slot_capacity: usize,
    ) -> Result<(), ErrorCondition> {
        if flow.handle.is_some() != flow.delivery_count.is_some()
            || flow.handle.is_some() != flow.link_credit.is_some()
        {
            return Err(ErrorCondition::DecodeError);
        }

        let next_incoming_id = i64::from(flow.next_incoming_id.unwrap_or(0));
        self.windows.next_incoming_id = flow.next_outgoing_id;
        self.windows.remote_incoming_window = next_incoming_id + i64::from(flow.incoming_window)
            - i64::from(self.windows.next_outgoing_id);
        self.windows.remote_outgoing_window = i64::from(flow.outgoing_window);

        if let Some(handle) = flow.handle {
            let Some(link) = self.links.get_mut(&handle) else {
                return Err(ErrorCondition::NotAllowed);
            };
            link.on_decode_flow(
                ctx,
                trace_id,
                authorization,
                flow.delivery_count.unwrap_or(0),
                flow.link_credit.unwrap_or(0),
                max_frame_size,
                slot_capacity,
            );
        }
        Ok(())
    }

    /// Tear down every link; closed links leave the table.
    pub(crate) fn cleanup(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        for link in self.links.values_mut() {
            link.cleanup(ctx, trace_id, authorization);
        }
        self.links.retain(|_, link| {
            if link.is_closed() {
                link.unregister(ctx);
                false
            } else {
                true
            }
        });
    }
}
