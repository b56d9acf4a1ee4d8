use super::*;

#[derive(Clone)]
pub struct Thread {
    process: RaftProcess,
}

impl Thread {
    fn do_loop(self) -> ThreadHandle {
        let hdl = tokio::spawn(async move {
            loop {
                if self.process.is_killed() {
                    break;
                }
                let wakeup = self.process.commit_notify.notified();
                tokio::select! {
                    _ = wakeup => {}
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
                if self.process.is_killed() {
                    break;
                }
                self.process.advance_commit_index();
            }
        })
        .abort_handle();
        ThreadHandle(hdl)
    }
}

pub fn new(process: RaftProcess) -> ThreadHandle {
    Thread { process }.do_loop()
}
