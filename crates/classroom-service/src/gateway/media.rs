//! Media negotiation handlers.
//!
//! Each handler checks that the caller is bound to the addressed room before
//! delegating to the [`MediaRouterRegistry`](crate::media::MediaRouterRegistry).

use super::SessionGateway;
use crate::errors::CsError;
use crate::media::TransportDirection;
use crate::protocol::{
    AudioMode, AudioModeChanged, CloseProducer, Consume, Consumed, ConsumerResumed,
    ConnectTransport, CreateTransport, NewProducer, Produce, Produced, ProducerClosed,
    ResumeConsumer, ServerEvent, SetAudioMode, TransportConnected,
};
use common::types::{ConnectionId, RoomId};
use tracing::debug;

impl SessionGateway {
    pub(super) async fn router_capabilities(
        &self,
        connection: ConnectionId,
        room: &RoomId,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, room).await?;
        let capabilities = self.media.router_rtp_capabilities(room).await?;
        Ok(vec![ServerEvent::RouterRtpCapabilities(capabilities)])
    }

    pub(super) async fn create_transport(
        &self,
        connection: ConnectionId,
        req: CreateTransport,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &req.class_id).await?;
        let info = self
            .media
            .create_transport(
                &req.class_id,
                connection,
                TransportDirection::from_is_producer(req.is_producer),
            )
            .await?;
        Ok(vec![ServerEvent::TransportCreated(info)])
    }

    pub(super) async fn connect_transport(
        &self,
        connection: ConnectionId,
        req: ConnectTransport,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &req.class_id).await?;
        if req.dtls_parameters.fingerprints.is_empty() {
            return Err(CsError::Validation(
                "dtlsParameters must carry at least one fingerprint".to_string(),
            ));
        }
        self.media
            .connect_transport(
                &req.class_id,
                connection,
                req.transport_id,
                req.dtls_parameters,
            )
            .await?;
        Ok(vec![ServerEvent::TransportConnected(TransportConnected {
            transport_id: req.transport_id,
        })])
    }

    /// Create a producer and announce it to the rest of the room.
    pub(super) async fn produce(
        &self,
        connection: ConnectionId,
        req: Produce,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &req.class_id).await?;
        if req.rtp_parameters.codecs.is_empty() {
            return Err(CsError::Validation(
                "rtpParameters must list at least one codec".to_string(),
            ));
        }

        let producer_id = self
            .media
            .produce(
                &req.class_id,
                connection,
                req.transport_id,
                req.kind,
                req.rtp_parameters,
            )
            .await?;

        self.bus.broadcast_to_room(
            &req.class_id,
            ServerEvent::NewProducer(NewProducer {
                producer_id,
                kind: req.kind,
                sender_id: connection,
            }),
            Some(connection),
        );
        Ok(vec![ServerEvent::Produced(Produced { id: producer_id })])
    }

    pub(super) async fn consume(
        &self,
        connection: ConnectionId,
        req: Consume,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &req.class_id).await?;
        let consumer = self
            .media
            .consume(
                &req.class_id,
                connection,
                req.transport_id,
                req.producer_id,
                req.rtp_capabilities,
            )
            .await?;

        debug!(target: "cs.gateway", connection_id = %connection, consumer_id = %consumer.id, "Consumer created paused");
        Ok(vec![ServerEvent::Consumed(Consumed {
            id: consumer.id,
            producer_id: consumer.producer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
        })])
    }

    pub(super) async fn resume_consumer(
        &self,
        connection: ConnectionId,
        req: ResumeConsumer,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &req.class_id).await?;
        self.media
            .resume_consumer(&req.class_id, connection, req.consumer_id)
            .await?;
        Ok(vec![ServerEvent::ConsumerResumed(ConsumerResumed {
            id: req.consumer_id,
        })])
    }

    /// Close the caller's producer; everyone in the room, caller included,
    /// learns about it.
    pub(super) async fn close_producer(
        &self,
        connection: ConnectionId,
        req: CloseProducer,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &req.class_id).await?;
        self.media
            .close_producer(&req.class_id, connection, req.producer_id)
            .await?;
        self.bus.broadcast_to_room(
            &req.class_id,
            ServerEvent::ProducerClosed(ProducerClosed {
                producer_id: req.producer_id,
            }),
            None,
        );
        Ok(Vec::new())
    }

    /// Mute (pause) or unmute (resume) the caller's producer.
    pub(super) async fn set_audio_mode(
        &self,
        connection: ConnectionId,
        req: SetAudioMode,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &req.class_id).await?;
        self.media
            .set_producer_paused(
                &req.class_id,
                connection,
                req.producer_id,
                req.mode == AudioMode::Muted,
            )
            .await?;
        self.bus.broadcast_to_room(
            &req.class_id,
            ServerEvent::AudioModeChanged(AudioModeChanged {
                producer_id: req.producer_id,
                mode: req.mode,
                sender_id: connection,
            }),
            None,
        );
        Ok(Vec::new())
    }
}
