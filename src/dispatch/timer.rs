use std::time::Duration;

use tokio::{runtime::Handle, task::JoinHandle};

/// Отменяемый одноразовый таймер.
///
/// Отмена гонится со срабатыванием: `abort` может не успеть, поэтому
/// каждое планирование выдаёт поколение, и колбэк получает его первым
/// аргументом. Проигравший гонку колбэк обязан сверить поколение с
/// текущим (`generation()`) под замком владельца и стать no-op.
#[derive(Debug, Default)]
pub(crate) struct OneShotTimer {
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Отменяет предыдущее планирование и ставит новое.
    pub fn schedule<F>(&mut self, rt: &Handle, delay: Duration, f: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.task = Some(rt.spawn(async move {
            tokio::time::sleep(delay).await;
            f(generation);
        }));
        generation
    }

    /// Отмена: сдвигает поколение, так что уже летящий колбэк устареет.
    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_scheduled(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
