use super::*;

#[derive(Clone)]
pub struct Thread {
    process: RaftProcess,
    follower: NodeId,
}

impl Thread {
    async fn run_once(&self) {
        // Drain everything pending. One request is in flight at a time.
        while let Ok(true) = self.process.advance_replication(self.follower).await {}
    }

    fn do_loop(self) -> ThreadHandle {
        let hdl = tokio::spawn(async move {
            loop {
                if self.process.is_killed() {
                    break;
                }
                let wakeup = self.process.replication_notify[self.follower as usize].notified();
                tokio::select! {
                    _ = wakeup => {}
                    _ = tokio::time::sleep(self.process.config.heartbeat_interval) => {}
                }
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

pub fn new(process: RaftProcess, follower: NodeId) -> ThreadHandle {
    Thread { process, follower }.do_loop()
}
