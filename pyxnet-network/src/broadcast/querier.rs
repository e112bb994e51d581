//! Query broadcasts, and the results they produce.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    channel::{mpsc, oneshot},
    Stream, StreamExt,
};
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::{
    broadcast::{session, BadHubCache, BroadcastHost, SessionHandle},
    events::Subscription,
    protocol::message::{Query, QueryResult},
};

/// Something that happened to a running query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuerierEvent {
    /// A node found a match for the query.
    Result(QueryResult),
    /// The query expired. No more results are reported.
    Expired,
}

/// A running query broadcast.
///
/// Streams the [`QueryResult`]s for this query, then [`QuerierEvent::Expired`]
/// when the query expires. Dropping the querier stops the query, unless
/// another handle to its session is still alive.
#[derive(Debug)]
pub struct Querier {
    query: Query,
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<QuerierEvent>,
    stop: Option<oneshot::Sender<()>>,
}

impl Querier {
    /// Starts broadcasting `query`, reporting results from `results` until
    /// `expiry` has passed.
    pub(crate) fn start(
        query: Query,
        host: Arc<dyn BroadcastHost>,
        bad_hubs: Arc<BadHubCache>,
        hop_timeout: Duration,
        expiry: Duration,
        mut results: Subscription<QueryResult>,
    ) -> Querier {
        let guid = query.guid;
        let (session, _outcome) = session::spawn(query.clone(), host, bad_hubs, hop_timeout);

        let (events_tx, events) = mpsc::unbounded();
        let (stop, mut stop_rx) = oneshot::channel();

        let expiring_session = session.clone();
        let report = async move {
            let expired = tokio::time::sleep(expiry);
            tokio::pin!(expired);

            loop {
                tokio::select! {
                    result = results.events.next() => match result {
                        Some(result) if result.query_guid == guid => {
                            trace!(from = %result.result_node, "query result");
                            if events_tx.unbounded_send(QuerierEvent::Result(result)).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = &mut expired => {
                        debug!("query expired");
                        let _ = events_tx.unbounded_send(QuerierEvent::Expired);
                        expiring_session.stop();
                        break;
                    }
                    _ = &mut stop_rx => break,
                }
            }
        };
        tokio::spawn(report.instrument(debug_span!("querier", %guid)));

        Querier {
            query,
            session,
            events,
            stop: Some(stop),
        }
    }

    /// The query being broadcast.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The query GUID.
    pub fn guid(&self) -> Uuid {
        self.query.guid
    }

    /// The broadcast session of this query.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Stops the broadcast and result reporting.
    pub fn stop(&mut self) {
        self.session.stop();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Stream for Querier {
    type Item = QuerierEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}
