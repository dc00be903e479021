//! End-to-end reactor behavior over scripted conduits.

#![allow(clippy::unwrap_used)]

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use mailvault_server::{
    Clock, Connection, ConnectionHandler, Endpoint, Error, Event, EventHandler, MockClock,
    OwnerRef, Reactor, ReactorConfig, ReactorHandle, Role, ScriptedConduit,
};

/// Records every event it sees; optionally answers reads and shutdowns.
struct Recorder {
    events: Rc<RefCell<Vec<Event>>>,
    read_reply: Option<Vec<u8>>,
    goodbye: Option<Vec<u8>>,
}

impl Recorder {
    fn new(events: Rc<RefCell<Vec<Event>>>) -> Self {
        Self {
            events,
            read_reply: None,
            goodbye: None,
        }
    }
}

impl ConnectionHandler for Recorder {
    fn react(
        &mut self,
        event: Event,
        conn: &mut Endpoint,
        _reactor: &ReactorHandle,
    ) -> mailvault_server::Result<()> {
        self.events.borrow_mut().push(event);
        match event {
            Event::Read => {
                let buffered = conn.read_buffer().len();
                let _ = conn.read_buffer().split_to(buffered);
                if buffered > 0 {
                    if let Some(reply) = &self.read_reply {
                        conn.enqueue(reply);
                    }
                }
            }
            Event::Shutdown => {
                if let Some(goodbye) = &self.goodbye {
                    conn.enqueue(goodbye);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn reactor() -> (Reactor, Rc<MockClock>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let clock = MockClock::shared();
    let reactor = Reactor::with_clock(ReactorConfig::default(), Rc::clone(&clock) as _);
    (reactor, clock)
}

#[tokio::test(start_paused = true)]
async fn read_is_answered_in_the_same_iteration() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    let mut handler = Recorder::new(Rc::clone(&events));
    handler.read_reply = Some(b"a001 OK done\r\n".to_vec());
    handle.add_connection(Connection::established(
        Role::ImapServer,
        Box::new(conduit),
        Box::new(handler),
    ));

    script.push_read(b"a001 NOOP\r\n");
    reactor.run_once().await.unwrap();

    assert_eq!(*events.borrow(), vec![Event::Read]);
    assert_eq!(script.written(), b"a001 OK done\r\n");
    assert_eq!(reactor.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn eof_closes_after_final_read() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    handle.add_connection(Connection::established(
        Role::Pop3Server,
        Box::new(conduit),
        Box::new(Recorder::new(Rc::clone(&events))),
    ));

    script.push_read(b"QUIT\r\n");
    script.set_eof();
    reactor.run_once().await.unwrap();

    assert_eq!(*events.borrow(), vec![Event::Read, Event::Close]);
    assert_eq!(reactor.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_fires_timeout_once() {
    let (mut reactor, clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, _script) = ScriptedConduit::new();
    let mut conn = Connection::established(
        Role::ImapServer,
        Box::new(conduit),
        Box::new(Recorder::new(Rc::clone(&events))),
    );
    conn.endpoint_mut()
        .set_deadline(clock.now() + Duration::from_secs(30));
    handle.add_connection(conn);

    clock.advance(Duration::from_secs(30));
    reactor.run_once().await.unwrap();
    assert_eq!(*events.borrow(), vec![Event::Timeout]);

    // The deadline is disarmed after firing.
    clock.advance(Duration::from_secs(30));
    reactor.run_once().await.unwrap();
    assert_eq!(*events.borrow(), vec![Event::Timeout]);
}

struct Flag {
    fired: bool,
}

impl EventHandler for Flag {
    fn resume(&mut self) {
        self.fired = true;
    }
}

#[tokio::test(start_paused = true)]
async fn timers_notify_their_owner() {
    let (mut reactor, clock) = reactor();
    let handle = reactor.handle();

    let flag: Rc<RefCell<Flag>> = Rc::new(RefCell::new(Flag { fired: false }));
    handle.arm_timer(
        Duration::from_secs(5),
        None,
        Rc::downgrade(&flag) as OwnerRef,
    );

    clock.advance(Duration::from_secs(4));
    reactor.run_once().await.unwrap();
    assert!(!flag.borrow().fired);

    clock.advance(Duration::from_secs(1));
    reactor.run_once().await.unwrap();
    assert!(flag.borrow().fired);
}

#[tokio::test(start_paused = true)]
async fn cancelled_timer_does_not_fire() {
    let (mut reactor, clock) = reactor();
    let handle = reactor.handle();

    let flag: Rc<RefCell<Flag>> = Rc::new(RefCell::new(Flag { fired: false }));
    let id = handle.arm_timer(
        Duration::from_secs(5),
        None,
        Rc::downgrade(&flag) as OwnerRef,
    );
    handle.cancel_timer(id);

    clock.advance(Duration::from_secs(10));
    reactor.run_once().await.unwrap();
    assert!(!flag.borrow().fired);
}

#[tokio::test(start_paused = true)]
async fn connect_resolution_dispatches_connect() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    script.set_writable(false);
    handle.add_connection(Connection::connecting(
        Role::DatabaseClient,
        Box::new(conduit),
        Box::new(Recorder::new(Rc::clone(&events))),
    ));

    script.signal_connect();
    reactor.run_once().await.unwrap();
    assert_eq!(*events.borrow(), vec![Event::Connect]);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_dispatches_error_and_closes() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    script.set_writable(false);
    handle.add_connection(Connection::connecting(
        Role::DatabaseClient,
        Box::new(conduit),
        Box::new(Recorder::new(Rc::clone(&events))),
    ));

    script.signal_error();
    reactor.run_once().await.unwrap();
    assert_eq!(*events.borrow(), vec![Event::Error]);
    assert_eq!(reactor.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn broken_descriptor_is_isolated() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let bad_events = Rc::new(RefCell::new(Vec::new()));
    let (bad_conduit, bad_script) = ScriptedConduit::new();
    handle.add_connection(Connection::established(
        Role::ImapServer,
        Box::new(bad_conduit),
        Box::new(Recorder::new(Rc::clone(&bad_events))),
    ));

    let good_events = Rc::new(RefCell::new(Vec::new()));
    let (good_conduit, good_script) = ScriptedConduit::new();
    handle.add_connection(Connection::established(
        Role::ImapServer,
        Box::new(good_conduit),
        Box::new(Recorder::new(Rc::clone(&good_events))),
    ));

    bad_script.fail_poll(io::Error::from_raw_os_error(9));
    reactor.run_once().await.unwrap();
    assert_eq!(reactor.connection_count(), 1);

    // The survivor is still serviced.
    good_script.push_read(b"STAT\r\n");
    reactor.run_once().await.unwrap();
    assert_eq!(*good_events.borrow(), vec![Event::Read]);
}

#[tokio::test(start_paused = true)]
async fn unattributable_wait_error_is_fatal() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    handle.add_connection(Connection::established(
        Role::ImapServer,
        Box::new(conduit),
        Box::new(Recorder::new(Rc::clone(&events))),
    ));

    script.fail_poll(io::Error::from(io::ErrorKind::PermissionDenied));
    let err = reactor.run_once().await.unwrap_err();
    assert!(matches!(err, Error::Wait(_)));
}

struct Acceptor {
    accepted_events: Rc<RefCell<Vec<Event>>>,
}

impl ConnectionHandler for Acceptor {
    fn react(
        &mut self,
        event: Event,
        conn: &mut Endpoint,
        reactor: &ReactorHandle,
    ) -> mailvault_server::Result<()> {
        if event == Event::Read {
            while let Some((conduit, _peer)) = conn.accept()? {
                reactor.add_connection(Connection::established(
                    Role::ImapServer,
                    conduit,
                    Box::new(Recorder::new(Rc::clone(&self.accepted_events))),
                ));
            }
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn listener_hands_accepted_connections_to_the_reactor() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let accepted_events = Rc::new(RefCell::new(Vec::new()));
    let (listener, script) = ScriptedConduit::new();
    script.set_writable(false);
    handle.add_connection(Connection::established(
        Role::Listener,
        Box::new(listener),
        Box::new(Acceptor {
            accepted_events: Rc::clone(&accepted_events),
        }),
    ));

    let (client, client_script) = ScriptedConduit::new();
    script.push_accept(client);
    reactor.run_once().await.unwrap();

    // Adopted at the start of the next iteration, then serviced.
    client_script.push_read(b"a001 CAPABILITY\r\n");
    reactor.run_once().await.unwrap();
    assert_eq!(reactor.connection_count(), 2);
    assert_eq!(*accepted_events.borrow(), vec![Event::Read]);
}

#[tokio::test(start_paused = true)]
async fn startup_latch_holds_listeners_back() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();
    handle.set_startup(true);

    let accepted_events = Rc::new(RefCell::new(Vec::new()));
    let (listener, script) = ScriptedConduit::new();
    script.set_writable(false);
    handle.add_connection(Connection::established(
        Role::Listener,
        Box::new(listener),
        Box::new(Acceptor {
            accepted_events: Rc::clone(&accepted_events),
        }),
    ));

    let (client, _client_script) = ScriptedConduit::new();
    script.push_accept(client);
    reactor.run_once().await.unwrap();
    assert_eq!(reactor.connection_count(), 1);

    handle.set_startup(false);
    reactor.run_once().await.unwrap();
    reactor.run_once().await.unwrap();
    assert_eq!(reactor.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn write_error_dispatches_close_before_teardown() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    let mut handler = Recorder::new(Rc::clone(&events));
    handler.read_reply = Some(b"+OK\r\n".to_vec());
    handle.add_connection(Connection::established(
        Role::Pop3Server,
        Box::new(conduit),
        Box::new(handler),
    ));

    // The reply enqueued on Read hits a dead stream.
    script.fail_writes(io::ErrorKind::BrokenPipe);
    script.push_read(b"NOOP\r\n");
    reactor.run_once().await.unwrap();

    assert_eq!(*events.borrow(), vec![Event::Read, Event::Close]);
    assert_eq!(reactor.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn read_error_dispatches_close_before_teardown() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    handle.add_connection(Connection::established(
        Role::ImapServer,
        Box::new(conduit),
        Box::new(Recorder::new(Rc::clone(&events))),
    ));

    script.fail_reads(io::ErrorKind::ConnectionReset);
    reactor.run_once().await.unwrap();

    assert_eq!(*events.borrow(), vec![Event::Close]);
    assert_eq!(reactor.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn due_timers_fire_before_connection_dispatch() {
    let (mut reactor, clock) = reactor();
    let handle = reactor.handle();

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    struct TimerLog {
        log: Rc<RefCell<Vec<&'static str>>>,
    }
    impl EventHandler for TimerLog {
        fn resume(&mut self) {
            self.log.borrow_mut().push("timer");
        }
    }

    struct ReadLog {
        log: Rc<RefCell<Vec<&'static str>>>,
    }
    impl ConnectionHandler for ReadLog {
        fn react(
            &mut self,
            event: Event,
            conn: &mut Endpoint,
            _reactor: &ReactorHandle,
        ) -> mailvault_server::Result<()> {
            if event == Event::Read {
                let buffered = conn.read_buffer().len();
                let _ = conn.read_buffer().split_to(buffered);
                self.log.borrow_mut().push("read");
            }
            Ok(())
        }
    }

    let owner: Rc<RefCell<TimerLog>> = Rc::new(RefCell::new(TimerLog {
        log: Rc::clone(&log),
    }));
    handle.arm_timer(
        Duration::from_secs(1),
        None,
        Rc::downgrade(&owner) as OwnerRef,
    );

    let (conduit, script) = ScriptedConduit::new();
    handle.add_connection(Connection::established(
        Role::ImapServer,
        Box::new(conduit),
        Box::new(ReadLog {
            log: Rc::clone(&log),
        }),
    ));

    clock.advance(Duration::from_secs(1));
    script.push_read(b"a001 NOOP\r\n");
    reactor.run_once().await.unwrap();

    assert_eq!(*log.borrow(), vec!["timer", "read"]);
}

#[tokio::test(start_paused = true)]
async fn flush_all_drains_output_blocked_earlier() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    let mut handler = Recorder::new(Rc::clone(&events));
    handler.read_reply = Some(b"+OK\r\n".to_vec());
    handle.add_connection(Connection::established(
        Role::Pop3Server,
        Box::new(conduit),
        Box::new(handler),
    ));

    // The reply cannot leave while the stream refuses writes.
    script.set_writable(false);
    script.push_read(b"NOOP\r\n");
    reactor.run_once().await.unwrap();
    assert_eq!(script.written(), b"");

    script.set_writable(true);
    reactor.flush_all();
    assert_eq!(script.written(), b"+OK\r\n");
}

#[tokio::test(start_paused = true)]
async fn shutdown_says_goodbye_and_flushes() {
    let (mut reactor, _clock) = reactor();
    let handle = reactor.handle();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (conduit, script) = ScriptedConduit::new();
    let mut handler = Recorder::new(Rc::clone(&events));
    handler.goodbye = Some(b"* BYE shutting down\r\n".to_vec());
    handle.add_connection(Connection::established(
        Role::ImapServer,
        Box::new(conduit),
        Box::new(handler),
    ));

    reactor.run_once().await.unwrap();
    handle.stop();
    reactor.run().await.unwrap();

    assert_eq!(*events.borrow(), vec![Event::Shutdown]);
    assert_eq!(script.written(), b"* BYE shutting down\r\n");
    assert!(handle.in_shutdown());
}

#[tokio::test(start_paused = true)]
async fn connections_offered_during_shutdown_are_dropped() {
    let (reactor, _clock) = reactor();
    let handle = reactor.handle();
    handle.stop();

    let (conduit, _script) = ScriptedConduit::new();
    handle.add_connection(Connection::established(
        Role::ImapServer,
        Box::new(conduit),
        Box::new(Recorder::new(Rc::new(RefCell::new(Vec::new())))),
    ));
    assert_eq!(reactor.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeating_timer_fires_again() {
    let (mut reactor, clock) = reactor();
    let handle = reactor.handle();

    let count: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    struct Counter {
        count: Rc<RefCell<u32>>,
    }
    impl EventHandler for Counter {
        fn resume(&mut self) {
            *self.count.borrow_mut() += 1;
        }
    }
    let counter: Rc<RefCell<Counter>> = Rc::new(RefCell::new(Counter {
        count: Rc::clone(&count),
    }));
    handle.arm_timer(
        Duration::from_secs(10),
        Some(Duration::from_secs(10)),
        Rc::downgrade(&counter) as OwnerRef,
    );

    clock.advance(Duration::from_secs(10));
    reactor.run_once().await.unwrap();
    clock.advance(Duration::from_secs(10));
    reactor.run_once().await.unwrap();
    assert_eq!(*count.borrow(), 2);
}
