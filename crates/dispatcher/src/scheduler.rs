use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use taskflow_core::config::SchedulerConfig;
use taskflow_core::models::keys::{job_key, JOB_KEY_PATTERN};
use taskflow_core::models::{
    CronFields, IntervalConfig, JobArguments, JobStatus, ScheduledJob, TriggerConfig,
};
use taskflow_core::{
    DurableStore, FunctionRegistry, JobFunction, SchedulerError, SchedulerResult,
};
use taskflow_infrastructure::{MetricsCollector, StructuredLogger};

use crate::triggers::Trigger;

/// 写回执行结果时遇到存储故障的最大重试次数
const RESULT_WRITE_ATTEMPTS: u32 = 5;

/// 进程重启后被中断的执行记录的错误信息
pub const INTERRUPTED_ERROR: &str = "interrupted";

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub job_ttl: Duration,
    pub misfire_grace_time: u64,
    pub max_instances: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            job_ttl: Duration::from_secs(config.job_ttl_seconds),
            misfire_grace_time: config.misfire_grace_time_seconds,
            max_instances: config.max_instances,
        }
    }
}

/// 添加作业时的可选参数，未设置时使用调度器默认值
#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    pub max_instances: Option<u32>,
    pub misfire_grace_time: Option<u64>,
}

impl JobOptions {
    pub fn max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = Some(max_instances);
        self
    }

    pub fn misfire_grace_time(mut self, seconds: u64) -> Self {
        self.misfire_grace_time = Some(seconds);
        self
    }
}

/// 作业统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_jobs: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
}

/// 定时作业调度服务
///
/// 作业记录保存在存储中，调度循环按 `tick_interval` 扫描到期作业并在独立的
/// tokio 任务中执行。每次执行前先把占用写回存储（run_count、RUNNING、下一次时间），
/// 因此 DATE 作业即使进程重启也最多执行一次。`max_instances` 只在本进程内生效。
pub struct SchedulerService {
    store: Arc<dyn DurableStore>,
    functions: FunctionRegistry,
    settings: SchedulerSettings,
    in_flight: StdMutex<HashMap<String, u32>>,
    // 作业记录的读改写在本进程内串行化
    record_lock: Mutex<()>,
    invocations: StdMutex<JoinSet<()>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    metrics: MetricsCollector,
}

impl SchedulerService {
    pub fn new(store: Arc<dyn DurableStore>, settings: SchedulerSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            functions: FunctionRegistry::new(),
            settings,
            in_flight: StdMutex::new(HashMap::new()),
            record_lock: Mutex::new(()),
            invocations: StdMutex::new(JoinSet::new()),
            loop_handle: Mutex::new(None),
            shutdown_tx,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn from_config(store: Arc<dyn DurableStore>, config: &SchedulerConfig) -> Self {
        Self::new(store, SchedulerSettings::from(config))
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub async fn register_function(&self, name: &str, function: Arc<dyn JobFunction>) {
        self.functions.register(name, function).await;
        debug!("注册作业函数: {}", name);
    }

    pub async fn function_names(&self) -> Vec<String> {
        self.functions.names().await
    }

    pub async fn add_cron_job(
        &self,
        job_name: &str,
        function_name: &str,
        fields: CronFields,
        arguments: JobArguments,
        options: JobOptions,
    ) -> SchedulerResult<String> {
        self.add_job(
            job_name,
            function_name,
            TriggerConfig::Cron(fields),
            arguments,
            options,
        )
        .await
    }

    pub async fn add_interval_job(
        &self,
        job_name: &str,
        function_name: &str,
        interval: IntervalConfig,
        arguments: JobArguments,
        options: JobOptions,
    ) -> SchedulerResult<String> {
        self.add_job(
            job_name,
            function_name,
            TriggerConfig::Interval(interval),
            arguments,
            options,
        )
        .await
    }

    pub async fn add_date_job(
        &self,
        job_name: &str,
        function_name: &str,
        run_date: DateTime<Utc>,
        arguments: JobArguments,
        options: JobOptions,
    ) -> SchedulerResult<String> {
        self.add_job(
            job_name,
            function_name,
            TriggerConfig::Date { run_date },
            arguments,
            options,
        )
        .await
    }

    /// 添加作业并返回作业ID
    ///
    /// 函数未注册时返回 `HandlerNotFound`，触发器不会再触发时返回 `InvalidTrigger`。
    pub async fn add_job(
        &self,
        job_name: &str,
        function_name: &str,
        trigger_config: TriggerConfig,
        arguments: JobArguments,
        options: JobOptions,
    ) -> SchedulerResult<String> {
        self.functions.require(function_name).await?;

        let mut job = ScheduledJob::new(
            job_name,
            function_name,
            trigger_config,
            arguments,
            options.max_instances.unwrap_or(self.settings.max_instances),
            options
                .misfire_grace_time
                .unwrap_or(self.settings.misfire_grace_time),
        );

        let now = Utc::now();
        let trigger = Trigger::from_config(&job.trigger_config, job.created_at)?;
        let next_run = trigger.first_fire_time(now).ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!("作业 {job_name} 的触发器不会再触发"))
        })?;
        if !job.is_recurring() && is_beyond_grace(next_run, now, job.misfire_grace_time) {
            return Err(SchedulerError::InvalidTrigger(format!(
                "作业 {job_name} 的执行时间 {next_run} 已过去"
            )));
        }
        job.next_run = Some(next_run);

        self.save(&job, now).await?;
        info!(
            "添加作业: {} ({}), 类型: {:?}, 下次执行: {}",
            job.job_name, job.job_id, job.job_type, next_run
        );
        Ok(job.job_id)
    }

    pub async fn remove_job(&self, job_id: &str) -> SchedulerResult<bool> {
        let _guard = self.record_lock.lock().await;
        let removed = self.store.delete(&job_key(job_id)).await?;
        if removed {
            info!("删除作业: {}", job_id);
        }
        Ok(removed)
    }

    /// PENDING / RUNNING → PAUSED；执行中的调用会继续完成
    pub async fn pause_job(&self, job_id: &str) -> SchedulerResult<bool> {
        let _guard = self.record_lock.lock().await;
        let mut job = self.require(job_id).await?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            debug!("作业 {} 当前状态 {} 不能暂停", job_id, job.status);
            return Ok(false);
        }
        job.status = JobStatus::Paused;
        self.save(&job, Utc::now()).await?;
        info!("暂停作业: {} ({})", job.job_name, job_id);
        Ok(true)
    }

    /// PAUSED → PENDING，周期性作业从当前时间重新计算下一次执行时间
    pub async fn resume_job(&self, job_id: &str) -> SchedulerResult<bool> {
        let _guard = self.record_lock.lock().await;
        let mut job = self.require(job_id).await?;
        if job.status != JobStatus::Paused {
            debug!("作业 {} 当前状态 {} 不需要恢复", job_id, job.status);
            return Ok(false);
        }

        let now = Utc::now();
        if job.is_recurring() {
            let trigger = Trigger::from_config(&job.trigger_config, job.created_at)?;
            job.next_run = trigger.first_fire_time(now);
        }
        job.status = if job.unfinished_runs() > 0 {
            JobStatus::Running
        } else {
            JobStatus::Pending
        };
        self.save(&job, now).await?;
        info!(
            "恢复作业: {} ({}), 下次执行: {:?}",
            job.job_name, job_id, job.next_run
        );
        Ok(true)
    }

    pub async fn get_job(&self, job_id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        self.load(&job_key(job_id)).await
    }

    pub async fn get_job_by_name(&self, job_name: &str) -> SchedulerResult<Option<ScheduledJob>> {
        Ok(self
            .get_all_jobs()
            .await?
            .into_iter()
            .find(|job| job.job_name == job_name))
    }

    /// 所有作业，按创建时间排序
    pub async fn get_all_jobs(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        let mut jobs = Vec::new();
        for key in self.store.keys(JOB_KEY_PATTERN).await? {
            if let Some(job) = self.load(&key).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    pub async fn get_stats(&self) -> SchedulerResult<SchedulerStats> {
        let jobs = self.get_all_jobs().await?;
        let mut stats = SchedulerStats {
            total_jobs: jobs.len(),
            by_status: JobStatus::ALL
                .iter()
                .map(|status| (status.to_string(), 0))
                .collect(),
            ..SchedulerStats::default()
        };

        for job in &jobs {
            *stats.by_status.entry(job.status.to_string()).or_default() += 1;
            stats.total_runs += job.run_count;
            stats.total_successes += job.success_count;
            stats.total_failures += job.failure_count;
        }

        let finished = stats.total_successes + stats.total_failures;
        if finished > 0 {
            stats.success_rate = stats.total_successes as f64 / finished as f64;
        }
        Ok(stats)
    }

    /// 预览作业接下来的若干次执行时间
    pub async fn next_fire_times(
        &self,
        job_id: &str,
        count: usize,
    ) -> SchedulerResult<Vec<DateTime<Utc>>> {
        let job = self.require(job_id).await?;
        let Some(next_run) = job.next_run else {
            return Ok(Vec::new());
        };
        let trigger = Trigger::from_config(&job.trigger_config, job.created_at)?;

        let mut times = Vec::with_capacity(count);
        let mut cursor = Some(next_run);
        while let Some(time) = cursor {
            if times.len() >= count {
                break;
            }
            times.push(time);
            cursor = trigger.next_fire_time(time);
        }
        Ok(times)
    }

    /// 处理上一个进程遗留的执行中记录
    ///
    /// 未记录结果的执行计为失败；周期性作业回到 PENDING，DATE 作业标记为 FAILED，
    /// 都不会补执行。只应在本进程没有执行中的调用时调用。
    pub async fn recover_interrupted_jobs(&self) -> SchedulerResult<usize> {
        let _guard = self.record_lock.lock().await;
        let now = Utc::now();
        let mut recovered = 0;

        for key in self.store.keys(JOB_KEY_PATTERN).await? {
            let Some(mut job) = self.load(&key).await? else {
                continue;
            };
            let interrupted = job.unfinished_runs();
            if interrupted == 0 && job.status != JobStatus::Running {
                continue;
            }

            job.failure_count += interrupted;
            job.last_error = Some(INTERRUPTED_ERROR.to_string());
            if job.status == JobStatus::Running {
                if job.is_recurring() {
                    job.status = JobStatus::Pending;
                    if job.next_run.is_none() {
                        let trigger = Trigger::from_config(&job.trigger_config, job.created_at)?;
                        job.next_run = trigger.first_fire_time(now);
                    }
                } else {
                    job.status = JobStatus::Failed;
                    job.next_run = None;
                }
            }

            self.save(&job, now).await?;
            warn!(
                "恢复被中断的作业: {} ({}), 中断的执行数: {}, 当前状态: {}",
                job.job_name, job.job_id, interrupted, job.status
            );
            recovered += 1;
        }

        if recovered > 0 {
            info!("共恢复 {} 个被中断的作业", recovered);
        }
        Ok(recovered)
    }

    /// 启动调度循环
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        let mut loop_handle = self.loop_handle.lock().await;
        if loop_handle.is_some() {
            warn!("调度循环已在运行");
            return Ok(());
        }

        self.recover_interrupted_jobs().await?;

        let service = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *loop_handle = Some(tokio::spawn(async move {
            service.tick_loop(shutdown_rx).await;
        }));

        info!(
            "调度器已启动, 扫描间隔: {}ms",
            self.settings.tick_interval.as_millis()
        );
        Ok(())
    }

    /// 停止调度循环并等待执行中的调用结束
    pub async fn stop(&self) {
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                error!("调度循环异常退出: {}", e);
            }
        }

        let mut invocations = match self.invocations.lock() {
            Ok(mut set) => std::mem::take(&mut *set),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let pending = invocations.len();
        if pending > 0 {
            info!("等待 {} 个执行中的作业完成", pending);
        }
        while invocations.join_next().await.is_some() {}

        info!("调度器已停止");
    }

    pub async fn is_running(&self) -> bool {
        self.loop_handle.lock().await.is_some()
    }

    async fn tick_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_pending_once(Utc::now()).await {
                        Ok(started) if started > 0 => debug!("本轮触发 {} 个作业", started),
                        Ok(_) => {}
                        Err(e) if e.is_transient() => warn!("存储不可用，等待下一轮扫描: {}", e),
                        Err(e) => error!("调度扫描失败: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("调度循环收到关闭信号");
                    break;
                }
            }
        }
    }

    /// 按给定时间执行一轮调度，返回本轮启动的调用数
    pub async fn run_pending_once(self: &Arc<Self>, now: DateTime<Utc>) -> SchedulerResult<usize> {
        self.reap_invocations();

        let mut started = 0;
        for key in self.store.keys(JOB_KEY_PATTERN).await? {
            let _guard = self.record_lock.lock().await;
            let job = match self.load(&key).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    error!("无法读取作业记录 {}: {}", key, e);
                    continue;
                }
            };

            match self.dispatch(job, now).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => error!("作业调度失败 {}: {}", key, e),
            }
        }
        Ok(started)
    }

    /// 调用方持有 `record_lock`
    async fn dispatch(self: &Arc<Self>, mut job: ScheduledJob, now: DateTime<Utc>) -> SchedulerResult<bool> {
        if !job.is_schedulable() {
            return Ok(false);
        }
        let Some(scheduled_at) = job.next_run else {
            return Ok(false);
        };
        if scheduled_at > now {
            return Ok(false);
        }

        let trigger = Trigger::from_config(&job.trigger_config, job.created_at)?;

        if let Some(misfire) = check_misfire(&job, scheduled_at, now) {
            StructuredLogger::log_job_misfire(&job.job_name, &misfire, job.misfire_grace_time);
            self.metrics.record_job_misfire(&job.job_name);
            if job.is_recurring() {
                job.next_run = trigger.next_fire_time(now);
            } else {
                job.status = JobStatus::Missed;
                job.next_run = None;
            }
            self.save(&job, now).await?;
            return Ok(false);
        }

        let running = self.in_flight_count(&job.job_id);
        if running >= job.max_instances {
            StructuredLogger::log_job_skipped(
                &job.job_id,
                &job.job_name,
                running,
                job.max_instances,
            );
            if job.is_recurring() {
                job.next_run = trigger.next_fire_time(now);
                self.save(&job, now).await?;
            }
            return Ok(false);
        }

        job.run_count += 1;
        job.last_run = Some(now);
        job.status = JobStatus::Running;
        job.next_run = if job.is_recurring() {
            trigger.next_fire_time(now)
        } else {
            None
        };
        self.save(&job, now).await?;

        StructuredLogger::log_job_fired(&job.job_id, &job.job_name, scheduled_at);
        self.spawn_invocation(job);
        Ok(true)
    }

    fn spawn_invocation(self: &Arc<Self>, job: ScheduledJob) {
        self.adjust_in_flight(&job.job_id, true);

        let service = Arc::clone(self);
        let future = async move {
            let started = Instant::now();
            let outcome = service.invoke(&job).await;
            let duration = started.elapsed();

            service.metrics.record_job_run(
                &job.job_name,
                outcome.is_ok(),
                duration.as_secs_f64(),
            );
            StructuredLogger::log_job_finished(
                &job.job_id,
                &job.job_name,
                outcome.is_ok(),
                duration.as_millis() as u64,
                outcome.as_ref().err().map(String::as_str),
            );

            service.record_outcome(&job.job_id, outcome).await;
            service.adjust_in_flight(&job.job_id, false);
        };

        match self.invocations.lock() {
            Ok(mut set) => {
                set.spawn(future);
            }
            Err(poisoned) => {
                poisoned.into_inner().spawn(future);
            }
        }
    }

    /// 在独立任务中执行作业函数，panic 也会被当作失败记录
    async fn invoke(&self, job: &ScheduledJob) -> Result<Value, String> {
        let function = self
            .functions
            .require(&job.function_name)
            .await
            .map_err(|e| e.to_string())?;
        let arguments = job.arguments();

        match tokio::spawn(async move { function.call(arguments).await }).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(e) => Err(format!("作业函数异常退出: {e}")),
        }
    }

    async fn record_outcome(&self, job_id: &str, outcome: Result<Value, String>) {
        let mut delay = Duration::from_millis(200);
        for attempt in 1..=RESULT_WRITE_ATTEMPTS {
            match self.apply_outcome(job_id, &outcome).await {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < RESULT_WRITE_ATTEMPTS => {
                    warn!(
                        "写回作业 {} 的执行结果失败 (第{}次), {}ms后重试: {}",
                        job_id,
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!("无法写回作业 {} 的执行结果: {}", job_id, e);
                    return;
                }
            }
        }
    }

    async fn apply_outcome(&self, job_id: &str, outcome: &Result<Value, String>) -> SchedulerResult<()> {
        let _guard = self.record_lock.lock().await;
        let Some(mut job) = self.load(&job_key(job_id)).await? else {
            debug!("作业 {} 已在执行期间被删除", job_id);
            return Ok(());
        };

        match outcome {
            Ok(_) => job.success_count += 1,
            Err(message) => {
                job.failure_count += 1;
                job.last_error = Some(message.clone());
            }
        }

        job.status = match job.status {
            JobStatus::Paused => JobStatus::Paused,
            _ if job.is_recurring() && job.unfinished_runs() > 0 => JobStatus::Running,
            _ if job.is_recurring() => JobStatus::Pending,
            _ if outcome.is_ok() => JobStatus::Completed,
            _ => JobStatus::Failed,
        };

        self.save(&job, Utc::now()).await
    }

    fn in_flight_count(&self, job_id: &str) -> u32 {
        match self.in_flight.lock() {
            Ok(map) => map.get(job_id).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(job_id).copied().unwrap_or(0),
        }
    }

    fn adjust_in_flight(&self, job_id: &str, increment: bool) {
        let mut map = match self.in_flight.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = map.entry(job_id.to_string()).or_insert(0);
        if increment {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(job_id);
            }
        }
    }

    fn reap_invocations(&self) {
        let mut set = match self.invocations.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Some(result) = set.try_join_next() {
            if let Err(e) = result {
                error!("作业执行任务异常退出: {}", e);
            }
        }
    }

    async fn require(&self, job_id: &str) -> SchedulerResult<ScheduledJob> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    async fn load(&self, key: &str) -> SchedulerResult<Option<ScheduledJob>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &ScheduledJob, now: DateTime<Utc>) -> SchedulerResult<()> {
        let raw = serde_json::to_string(job)?;
        let ttl = self.record_ttl(job, now);
        self.store.set(&job_key(&job.job_id), &raw, ttl).await
    }

    /// 暂停的作业不过期；下一次执行远于基础TTL时，TTL延长到覆盖下一次执行
    fn record_ttl(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Option<Duration> {
        if job.status == JobStatus::Paused {
            return None;
        }
        let base = self.settings.job_ttl;
        let until_next = job
            .next_run
            .and_then(|next| (next - now).to_std().ok())
            .unwrap_or_default();
        if until_next > base {
            Some(until_next + base)
        } else {
            Some(base)
        }
    }
}

/// 超出宽限时间时返回 `Misfire`
fn check_misfire(
    job: &ScheduledJob,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<SchedulerError> {
    is_beyond_grace(scheduled_at, now, job.misfire_grace_time).then(|| SchedulerError::Misfire {
        job_id: job.job_id.clone(),
        late_seconds: (now - scheduled_at).num_seconds(),
    })
}

fn is_beyond_grace(scheduled_at: DateTime<Utc>, now: DateTime<Utc>, grace_seconds: u64) -> bool {
    (now - scheduled_at).num_milliseconds() > (grace_seconds as i64).saturating_mul(1000)
}
