use bytes::Bytes;
use std::{sync::Arc, time::Duration};

use diapoll::{
    api::{
        builder::LinkBuilder,
        sink::{ChannelEvent, FlumeSink},
    },
    core::{
        bus::{Bus, LinkId},
        event::LinkEvent,
        health::HealthState,
        link::DeviceLink,
        scheduler::{ManualScheduler, TimerKind},
    },
    protocol::{
        codec::{append_crc, FaultKind, ModbusRtuCodec, RegisterMode, Value},
        transport::MemoryTransport,
    },
};

struct Harness {
    link: DeviceLink,
    scheduler: Arc<ManualScheduler>,
    transport: Arc<MemoryTransport>,
    bus: Arc<Bus>,
    events: flume::Receiver<LinkEvent>,
    published: flume::Receiver<ChannelEvent>,
}

impl Harness {
    fn new(builder: LinkBuilder) -> Self {
        let scheduler = Arc::new(ManualScheduler::new());
        let transport = Arc::new(MemoryTransport::new("rs485"));
        let bus = Bus::new(transport.clone());
        let (sink, published) = FlumeSink::new();
        let (events_tx, events) = flume::unbounded();
        let mut link = builder
            .build(
                LinkId(0),
                bus.clone(),
                events_tx,
                scheduler.clone(),
                Arc::new(sink),
            )
            .unwrap();
        link.start();
        Self {
            link,
            scheduler,
            transport,
            bus,
            events,
            published,
        }
    }

    fn poll(&mut self) {
        let event = self.scheduler.fire(TimerKind::Poll).expect("poll timer armed");
        self.link.handle_event(event);
    }

    fn expire(&mut self) {
        let event = self
            .scheduler
            .fire(TimerKind::ResponseDeadline)
            .expect("deadline armed");
        self.link.handle_event(event);
    }

    /// Route bytes through the bus as the router task would, then run the link.
    fn deliver(&mut self, chunk: &[u8]) {
        self.bus.route(Bytes::copy_from_slice(chunk));
        while let Ok(event) = self.events.try_recv() {
            self.link.handle_event(event);
        }
    }

    fn poll_and_miss(&mut self, times: u32) {
        for _ in 0..times {
            self.poll();
            self.expire();
        }
    }

    fn next_poll_delay(&self) -> Duration {
        self.scheduler.armed(TimerKind::Poll).unwrap().delay
    }

    fn drain(&self) -> Vec<ChannelEvent> {
        self.published.drain().collect()
    }
}

fn boiler() -> LinkBuilder {
    LinkBuilder::new("boiler")
        .with_codec(ModbusRtuCodec::new(7, RegisterMode::Holding, 0x10, 2))
        .with_poll_interval(60_000)
        .with_response_timeout(5_000)
        .with_initial_poll_delay(1_000)
        .with_stale_after_missed(3)
        .with_offline_after_missed(10)
}

fn good_response() -> Vec<u8> {
    let mut frame = vec![0x07, 0x03, 0x04, 0x00, 0x2A, 0x01, 0x00];
    append_crc(&mut frame);
    frame
}

fn states(events: &[ChannelEvent]) -> Vec<HealthState> {
    events
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::State { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn faults(events: &[ChannelEvent]) -> Vec<FaultKind> {
    events
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::Error { fault, .. } => Some(*fault),
            _ => None,
        })
        .collect()
}

fn values(events: &[ChannelEvent]) -> Vec<(String, Value)> {
    events
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::Value { name, value, .. } => Some((name.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn stale_then_offline_after_missed_responses() {
    let mut h = Harness::new(boiler());
    assert_eq!(h.scheduler.armed(TimerKind::Poll).unwrap().delay, Duration::from_secs(1));

    h.poll();
    let request = h.transport.last_sent().unwrap();
    assert_eq!(request.len(), 8);
    assert_eq!(&request[..6], &[0x07, 0x03, 0x00, 0x10, 0x00, 0x02]);
    h.deliver(&good_response());
    assert_eq!(h.link.state(), HealthState::Active);
    assert_eq!(h.link.health().consecutive_missed, 0);
    let published = h.drain();
    assert_eq!(states(&published), vec![HealthState::Active]);
    assert_eq!(
        values(&published),
        vec![
            ("hr_16".to_string(), Value::Int(42)),
            ("hr_17".to_string(), Value::Int(256)),
        ]
    );

    h.poll_and_miss(3);
    assert_eq!(h.link.state(), HealthState::Stale);
    let published = h.drain();
    assert_eq!(states(&published), vec![HealthState::Stale]);
    assert!(values(&published).is_empty());
    assert_eq!(faults(&published), vec![FaultKind::ResponseTimeout; 3]);
    assert_eq!(h.link.values()[0].1, Value::Int(42));

    h.poll_and_miss(7);
    assert_eq!(h.link.state(), HealthState::Offline);
    assert_eq!(h.link.health().consecutive_missed, 10);
    let published = h.drain();
    assert_eq!(states(&published), vec![HealthState::Offline]);
    assert_eq!(
        values(&published),
        vec![
            ("hr_16".to_string(), Value::Invalid),
            ("hr_17".to_string(), Value::Invalid),
        ]
    );
}

#[test]
fn success_while_offline_restores_base_interval() {
    let mut h = Harness::new(boiler().with_offline_backoff(6));
    h.poll();
    h.deliver(&good_response());
    h.poll_and_miss(10);
    assert_eq!(h.link.state(), HealthState::Offline);

    // the first poll fired while Offline schedules the next one with backoff
    h.poll();
    assert_eq!(h.next_poll_delay(), Duration::from_secs(360));

    h.deliver(&good_response());
    assert_eq!(h.link.state(), HealthState::Active);
    assert_eq!(h.link.health().consecutive_missed, 0);
    assert_eq!(h.next_poll_delay(), Duration::from_secs(60));
}

#[test]
fn checksum_failure_flags_exception_and_keeps_values() {
    let mut h = Harness::new(boiler());
    h.poll();
    h.deliver(&good_response());
    h.poll_and_miss(2);
    h.drain();

    h.poll();
    let mut corrupt = good_response();
    corrupt[3] ^= 0x40;
    h.deliver(&corrupt);

    assert_eq!(h.link.state(), HealthState::Exception);
    assert_eq!(h.link.health().consecutive_missed, 2);
    assert_eq!(h.link.values()[0].1, Value::Int(42));
    let published = h.drain();
    assert_eq!(states(&published), vec![HealthState::Exception]);
    assert_eq!(faults(&published), vec![FaultKind::ChecksumMismatch]);
    assert!(values(&published).is_empty());
}

#[test]
fn device_exception_is_published_with_code() {
    let mut h = Harness::new(boiler());
    h.poll();
    let mut frame = vec![0x07, 0x83, 0x02];
    append_crc(&mut frame);
    h.deliver(&frame);

    assert_eq!(h.link.state(), HealthState::Exception);
    assert_eq!(
        faults(&h.drain()),
        vec![FaultKind::DeviceException { code: 0x02 }]
    );
    // the deadline was cancelled by the response
    assert!(h.scheduler.armed(TimerKind::ResponseDeadline).is_none());
}

#[test]
fn late_response_routed_after_deadline_restores_active() {
    let mut h = Harness::new(boiler());
    h.poll();
    h.deliver(&good_response());
    h.poll_and_miss(3);
    assert_eq!(h.link.state(), HealthState::Stale);

    h.poll();
    h.expire();
    assert_eq!(h.link.health().consecutive_missed, 4);
    assert_eq!(h.bus.holder(), None);
    h.drain();

    h.deliver(&good_response());
    assert_eq!(h.link.state(), HealthState::Active);
    assert_eq!(h.link.health().consecutive_missed, 0);
    let published = h.drain();
    assert_eq!(states(&published), vec![HealthState::Active]);
    assert_eq!(values(&published).len(), 2);
}

#[test]
fn fragmented_response_is_reassembled() {
    let mut h = Harness::new(boiler());
    h.poll();
    let frame = good_response();
    h.deliver(&frame[..4]);
    assert_eq!(h.link.state(), HealthState::Unknown);
    h.deliver(&frame[4..]);
    assert_eq!(h.link.state(), HealthState::Active);
}

#[test]
fn oversized_reassembly_reports_length_mismatch() {
    let mut h = Harness::new(boiler());
    h.poll();
    let frame = good_response();
    h.deliver(&frame[..4]);
    let mut tail = frame[4..].to_vec();
    tail.extend_from_slice(&[0xAA, 0xBB]);
    h.deliver(&tail);

    assert_eq!(h.link.state(), HealthState::Exception);
    assert_eq!(faults(&h.drain()), vec![FaultKind::LengthMismatch]);
    assert_eq!(h.link.health().consecutive_missed, 0);
}

#[test]
fn zero_offline_threshold_never_goes_offline() {
    let mut h = Harness::new(boiler().with_offline_after_missed(0).with_offline_backoff(6));
    h.poll();
    h.deliver(&good_response());
    h.poll_and_miss(50);
    assert_eq!(h.link.state(), HealthState::Stale);
    h.poll();
    assert_eq!(h.next_poll_delay(), Duration::from_secs(60));
}

#[test]
fn stop_and_restart_keep_health_history() {
    let mut h = Harness::new(boiler());
    h.poll();
    h.deliver(&good_response());
    h.poll_and_miss(3);
    assert_eq!(h.link.state(), HealthState::Stale);

    h.link.handle_event(LinkEvent::Stop);
    assert!(h.scheduler.armed(TimerKind::Poll).is_none());
    assert_eq!(h.link.state(), HealthState::Stale);

    h.link.handle_event(LinkEvent::Start);
    assert_eq!(h.next_poll_delay(), Duration::from_secs(1));
    assert_eq!(h.link.health().consecutive_missed, 3);
}

#[test]
fn links_sharing_a_bus_take_turns() {
    let scheduler = Arc::new(ManualScheduler::new());
    let transport = Arc::new(MemoryTransport::new("rs485"));
    let bus = Bus::new(transport.clone());
    let (sink, _published) = FlumeSink::new();
    let sink = Arc::new(sink);

    let (first_tx, first_rx) = flume::unbounded();
    let mut first = LinkBuilder::new("first")
        .with_codec(ModbusRtuCodec::new(1, RegisterMode::Holding, 0, 1))
        .build(LinkId(1), bus.clone(), first_tx, scheduler.clone(), sink.clone())
        .unwrap();
    let (second_tx, second_rx) = flume::unbounded();
    let mut second = LinkBuilder::new("second")
        .with_codec(ModbusRtuCodec::new(2, RegisterMode::Holding, 0, 1))
        .build(LinkId(2), bus.clone(), second_tx, scheduler.clone(), sink)
        .unwrap();

    first.start();
    second.start();
    first.on_poll_fire();
    second.on_poll_fire();
    // second is queued behind first
    assert_eq!(transport.sent_count(), 1);
    assert_eq!(bus.holder(), Some(LinkId(1)));

    let mut reply = vec![0x01, 0x03, 0x02, 0x00, 0x05];
    append_crc(&mut reply);
    bus.route(Bytes::from(reply));
    while let Ok(event) = first_rx.try_recv() {
        first.handle_event(event);
    }
    assert_eq!(first.state(), HealthState::Active);

    // releasing the bus granted it to the waiting link
    assert_eq!(bus.holder(), Some(LinkId(2)));
    let granted = second_rx.try_recv().unwrap();
    assert_eq!(granted, LinkEvent::BusGranted);
    second.handle_event(granted);
    assert_eq!(transport.sent_count(), 2);
    assert_eq!(transport.last_sent().unwrap()[0], 0x02);
}
