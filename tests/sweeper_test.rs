mod common;

#[cfg(test)]
mod tests {
    use super::common::{init_test_logging, WAIT};
    use sealed_promise::{spawn_sweeper, Context, DiagnosticSink, Failure, Promise};
    use std::{
        sync::{
            mpsc::{channel, Sender},
            Arc, Mutex,
        },
        time::Duration,
    };

    struct ChannelSink(Mutex<Sender<Failure>>);

    impl DiagnosticSink for ChannelSink {
        fn report(&self, failure: &Failure, _context: &str) {
            let _ = self.0.lock().unwrap().send(failure.clone());
        }
    }

    // The only test in this binary, since the sweeper drains the global tracker.
    #[test]
    fn test_sweeper_thread_reports_unhandled_rejection() {
        init_test_logging();
        let (tx, rx) = channel();
        let sink = Arc::new(ChannelSink(Mutex::new(tx)));
        spawn_sweeper(Duration::from_millis(10), Duration::from_millis(20), sink).expect("Failed to start the sweeper");

        let unhandled = Failure::from("left alone");
        let _chain = Promise::<u8>::rejected(unhandled.clone()).map_on(Context::Immediate, |v| Ok(v + 1));

        let reported = rx.recv_timeout(WAIT).expect("sweeper never reported");
        assert!(reported.same_as(&unhandled));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
