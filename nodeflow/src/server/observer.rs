use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use nodeflow_api::observer::v1::observer_server::Observer;
use nodeflow_api::observer::v1::{
    GetFlowsRequest, GetFlowsResponse, LostEvent, LostEventSource, ServerStatusRequest,
    ServerStatusResponse, get_flows_response,
};
use prost_types::Timestamp;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::ring::Ring;
use crate::server::filter::CompiledFilters;

/// Flows pulled from the ring per read while streaming.
const STREAM_BATCH: usize = 64;

pub struct ObserverService {
    ring: Arc<Ring>,
    start_time: Instant,
    cancel: CancellationToken,
}

impl ObserverService {
    /// `cancel` drains every open stream on shutdown.
    pub fn new(ring: Arc<Ring>, cancel: CancellationToken) -> Self {
        Self {
            ring,
            start_time: Instant::now(),
            cancel,
        }
    }
}

#[tonic::async_trait]
impl Observer for ObserverService {
    type GetFlowsStream = Pin<Box<dyn Stream<Item = Result<GetFlowsResponse, Status>> + Send>>;

    async fn get_flows(
        &self,
        request: Request<GetFlowsRequest>,
    ) -> Result<Response<Self::GetFlowsStream>, Status> {
        let req = request.into_inner();
        let filters = CompiledFilters::compile(&req.whitelist, &req.blacklist)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let limit = match req.number {
            0 => self.ring.capacity(),
            n => n,
        };

        // Pin the snapshot range and the cursor to the ring as it is
        // right now; the stream task may get scheduled much later.
        let snapshot_end = self.ring.seen();
        let start = match (&req.since, req.follow) {
            (Some(_), _) => self.ring.oldest(),
            (None, true) => snapshot_end,
            (None, false) => snapshot_end.saturating_sub(limit).max(self.ring.oldest()),
        };
        let tail = self.ring.tail(start);
        let query = Query {
            filters,
            since: req.since,
            until: req.until,
            follow: req.follow,
            limit,
            snapshot_end,
        };

        let (tx, rx) = mpsc::channel(STREAM_BATCH);
        tokio::spawn(stream_flows(tail, query, tx, self.cancel.child_token()));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn server_status(
        &self,
        _request: Request<ServerStatusRequest>,
    ) -> Result<Response<ServerStatusResponse>, Status> {
        Ok(Response::new(ServerStatusResponse {
            num_flows: self.ring.len(),
            max_flows: self.ring.capacity(),
            seen_flows: self.ring.seen(),
            uptime_ns: self.start_time.elapsed().as_nanos() as u64,
        }))
    }
}

struct Query {
    filters: CompiledFilters,
    since: Option<Timestamp>,
    until: Option<Timestamp>,
    follow: bool,
    limit: u64,
    snapshot_end: u64,
}

/// Streams ring contents to one client in write-index order. Without
/// `follow` the snapshot covers the flows present at call time: the
/// whole retained window when `since` is given, the most recent
/// `limit` entries otherwise. With `follow` the stream keeps going at
/// the live edge until the client or the server goes away.
async fn stream_flows(
    mut tail: crate::ring::Tail,
    query: Query,
    tx: mpsc::Sender<Result<GetFlowsResponse, Status>>,
    cancel: CancellationToken,
) {
    let snapshot_end = query.snapshot_end;
    let mut sent: u64 = 0;
    if !query.follow && tail.cursor() >= snapshot_end {
        return;
    }

    'stream: loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break 'stream,
            batch = tail.next_batch(STREAM_BATCH) => match batch {
                Some(batch) => batch,
                None => break 'stream,
            },
        };

        if batch.lost > 0 {
            let lost = GetFlowsResponse {
                response_types: Some(get_flows_response::ResponseTypes::LostEvents(LostEvent {
                    source: LostEventSource::RingBuffer as i32,
                    num_events_lost: batch.lost,
                })),
            };
            if tx.send(Ok(lost)).await.is_err() {
                break 'stream;
            }
        }

        for (index, flow) in batch.flows {
            if !query.follow && index >= snapshot_end {
                break 'stream;
            }
            if let Some(since) = &query.since
                && ts_key(&flow.time) < (since.seconds, since.nanos)
            {
                continue;
            }
            if let Some(until) = &query.until
                && ts_key(&flow.time) > (until.seconds, until.nanos)
            {
                break 'stream;
            }
            if !query.filters.matches(&flow) {
                continue;
            }
            let response = GetFlowsResponse {
                response_types: Some(get_flows_response::ResponseTypes::Flow(flow.as_ref().clone())),
            };
            if tx.send(Ok(response)).await.is_err() {
                break 'stream;
            }
            sent += 1;
            if !query.follow && sent >= query.limit {
                break 'stream;
            }
        }

        if !query.follow && tail.cursor() >= snapshot_end {
            break 'stream;
        }
    }
}

fn ts_key(time: &Option<Timestamp>) -> (i64, i32) {
    time.as_ref().map(|t| (t.seconds, t.nanos)).unwrap_or((0, 0))
}

#[cfg(test)]
mod test {
    use nodeflow_api::observer::v1::{Endpoint, Flow, FlowFilter, Verdict};
    use tokio_stream::StreamExt;

    use super::*;

    fn flow(seconds: i64, pod: &str) -> Arc<Flow> {
        let mut flow = Flow {
            time: Some(Timestamp { seconds, nanos: 0 }),
            source: Some(Endpoint {
                namespace: "default".into(),
                pod_name: pod.into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        flow.set_verdict(Verdict::Forwarded);
        Arc::new(flow)
    }

    async fn collect(
        service: &ObserverService,
        request: GetFlowsRequest,
    ) -> Vec<GetFlowsResponse> {
        let response = service.get_flows(Request::new(request)).await.unwrap();
        let mut stream = response.into_inner();
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.unwrap());
        }
        out
    }

    fn pods(responses: &[GetFlowsResponse]) -> Vec<String> {
        responses
            .iter()
            .filter_map(|r| match &r.response_types {
                Some(get_flows_response::ResponseTypes::Flow(flow)) => {
                    Some(flow.source.as_ref().unwrap().pod_name.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn service_with_flows(capacity: u64, flows: &[Arc<Flow>]) -> ObserverService {
        let ring = Arc::new(Ring::new(capacity));
        for flow in flows {
            ring.write(flow.clone());
        }
        ObserverService::new(ring, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_snapshot_returns_recent_flows_in_order() {
        let service = service_with_flows(
            8,
            &[flow(1, "a"), flow(2, "b"), flow(3, "c"), flow(4, "d")],
        );

        let responses = collect(&service, GetFlowsRequest::default()).await;
        assert_eq!(pods(&responses), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_snapshot_honors_number() {
        let service = service_with_flows(
            8,
            &[flow(1, "a"), flow(2, "b"), flow(3, "c"), flow(4, "d")],
        );

        let responses = collect(
            &service,
            GetFlowsRequest {
                number: 2,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(pods(&responses), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_snapshot_applies_filters() {
        let service = service_with_flows(
            8,
            &[flow(1, "a"), flow(2, "b"), flow(3, "a"), flow(4, "c")],
        );

        let responses = collect(
            &service,
            GetFlowsRequest {
                whitelist: vec![FlowFilter {
                    source_pod: vec!["a".into()],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .await;
        assert_eq!(pods(&responses), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_since_bounds_the_range() {
        let service = service_with_flows(
            8,
            &[flow(10, "a"), flow(20, "b"), flow(30, "c"), flow(40, "d")],
        );

        let responses = collect(
            &service,
            GetFlowsRequest {
                since: Some(Timestamp {
                    seconds: 25,
                    nanos: 0,
                }),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(pods(&responses), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_invalid_filter_closes_with_invalid_argument() {
        let service = service_with_flows(8, &[]);
        let result = service
            .get_flows(Request::new(GetFlowsRequest {
                whitelist: vec![FlowFilter {
                    source_port: vec!["eighty".into()],
                    ..Default::default()
                }],
                ..Default::default()
            }))
            .await;
        let status = match result {
            Ok(_) => panic!("expected an error response"),
            Err(status) => status,
        };
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_follow_delivers_new_writes() {
        let ring = Arc::new(Ring::new(8));
        ring.write(flow(1, "old"));
        let cancel = CancellationToken::new();
        let service = ObserverService::new(ring.clone(), cancel.clone());

        let response = service
            .get_flows(Request::new(GetFlowsRequest {
                follow: true,
                ..Default::default()
            }))
            .await
            .unwrap();
        let mut stream = response.into_inner();

        // written after the stream opened, so it is the first delivery
        ring.write(flow(2, "new"));
        let first = stream.next().await.unwrap().unwrap();
        match first.response_types {
            Some(get_flows_response::ResponseTypes::Flow(flow)) => {
                assert_eq!(flow.source.unwrap().pod_name, "new");
            }
            other => panic!("expected flow, got {:?}", other),
        }

        // draining the server ends the stream
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_overrun_follow_reader_gets_lost_marker() {
        let ring = Arc::new(Ring::new(4));
        ring.write(flow(1, "p1"));
        let service = ObserverService::new(ring.clone(), CancellationToken::new());

        let response = service
            .get_flows(Request::new(GetFlowsRequest {
                follow: true,
                ..Default::default()
            }))
            .await
            .unwrap();
        let mut stream = response.into_inner();

        // overrun the reader's cursor by more than a full capacity
        // before it gets to read anything
        for seconds in 2..=11 {
            ring.write(flow(seconds, &format!("p{seconds}")));
        }

        let first = stream.next().await.unwrap().unwrap();
        match first.response_types {
            Some(get_flows_response::ResponseTypes::LostEvents(lost)) => {
                assert_eq!(lost.num_events_lost, 6);
                assert_eq!(lost.source(), LostEventSource::RingBuffer);
            }
            other => panic!("expected lost marker, got {:?}", other),
        }
        // delivery resumes at the oldest still-present flow
        let second = stream.next().await.unwrap().unwrap();
        match second.response_types {
            Some(get_flows_response::ResponseTypes::Flow(flow)) => {
                assert_eq!(flow.source.unwrap().pod_name, "p8");
            }
            other => panic!("expected flow, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_status_reports_ring_fill() {
        let service = service_with_flows(4, &[flow(1, "a"), flow(2, "b")]);
        let status = service
            .server_status(Request::new(ServerStatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.num_flows, 2);
        assert_eq!(status.max_flows, 4);
        assert_eq!(status.seen_flows, 2);
    }

    #[tokio::test]
    async fn test_overrun_reader_gets_lost_marker() {
        let ring = Arc::new(Ring::new(4));
        for seconds in 1..=10 {
            ring.write(flow(seconds, &format!("p{seconds}")));
        }
        let service = ObserverService::new(ring, CancellationToken::new());

        // ask for the whole window since the beginning of time
        let responses = collect(
            &service,
            GetFlowsRequest {
                since: Some(Timestamp {
                    seconds: 0,
                    nanos: 0,
                }),
                ..Default::default()
            },
        )
        .await;
        // oldest retained flow is index 6 (p7); nothing earlier, so no
        // lost marker: the tail starts inside the retained window
        assert_eq!(pods(&responses), vec!["p7", "p8", "p9", "p10"]);
    }
}
