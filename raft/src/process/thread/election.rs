use super::*;

#[derive(Clone)]
pub struct Thread {
    process: RaftProcess,
}

impl Thread {
    async fn run_once(&self) {
        let due = {
            let core = self.process.core.lock().unwrap();
            core.role != Role::Leader && Instant::now() >= core.election_deadline
        };
        // No heartbeat from a leader for a full timeout: try to become one.
        if due {
            self.process.run_election().await;
        }
    }

    fn do_loop(self) -> ThreadHandle {
        let hdl = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                interval.tick().await;
                if self.process.is_killed() {
                    break;
                }
                self.run_once().await;
            }
        })
        .abort_handle();
        ThreadHandle(hdl)
    }
}

pub fn new(process: RaftProcess) -> ThreadHandle {
    Thread { process }.do_loop()
}
