use std::sync::Arc;

use anyhow::{Context, Result};
use taskflow_core::config::{AppConfig, JobDefinition};
use taskflow_core::{DurableStore, JobArguments};
use taskflow_dispatcher::{JobOptions, SchedulerService};
use taskflow_infrastructure::StoreFactory;
use taskflow_worker::TaskManager;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::builtin::{register_builtin_functions, register_builtin_handlers};

/// 主应用程序
///
/// 按配置组装存储、任务队列与Worker池、定时调度器。
pub struct Application {
    config: AppConfig,
    store: Arc<dyn DurableStore>,
    task_manager: Arc<TaskManager>,
    scheduler: Arc<SchedulerService>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let store = StoreFactory::create(&config.store)
            .await
            .context("创建存储后端失败")?;

        let task_manager = Arc::new(TaskManager::new(
            Arc::clone(&store),
            config.queue.clone(),
            &config.worker,
        ));
        for queue in &config.worker.queues {
            register_builtin_handlers(&task_manager, &queue.name).await;
        }

        let scheduler = Arc::new(SchedulerService::from_config(
            Arc::clone(&store),
            &config.scheduler,
        ));
        register_builtin_functions(&scheduler).await;

        let app = Self {
            config,
            store,
            task_manager,
            scheduler,
        };
        app.add_configured_jobs().await?;
        Ok(app)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DurableStore> {
        Arc::clone(&self.store)
    }

    pub fn task_manager(&self) -> Arc<TaskManager> {
        Arc::clone(&self.task_manager)
    }

    pub fn scheduler(&self) -> Arc<SchedulerService> {
        Arc::clone(&self.scheduler)
    }

    /// 启动Worker池与调度循环，收到关闭信号后依次停止
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        if self.config.worker.enabled {
            for queue in &self.config.worker.queues {
                self.task_manager
                    .start_workers(&queue.name, queue.workers)
                    .await;
            }
        } else {
            info!("Worker池已禁用");
        }

        if self.config.scheduler.enabled {
            self.scheduler
                .start()
                .await
                .context("启动调度器失败")?;
        } else {
            info!("定时调度已禁用");
        }

        info!("应用已启动");
        let _ = shutdown_rx.recv().await;
        info!("开始停止应用组件");

        self.scheduler.stop().await;
        self.task_manager.stop_workers().await;

        match self.task_manager.get_stats().await {
            Ok(stats) => info!(
                "任务统计: 总数 {}, 完成 {}, 失败 {}, 成功率 {:.2}",
                stats.total_tasks, stats.completed, stats.failed, stats.success_rate
            ),
            Err(e) => warn!("无法读取任务统计: {}", e),
        }
        Ok(())
    }

    /// 添加配置文件中声明的作业，存储中已有同名作业时跳过
    async fn add_configured_jobs(&self) -> Result<()> {
        for definition in &self.config.scheduler.jobs {
            if let Some(existing) = self.scheduler.get_job_by_name(&definition.name).await? {
                info!(
                    "作业 {} 已存在 ({})，跳过添加",
                    definition.name, existing.job_id
                );
                continue;
            }
            let job_id = self
                .add_definition(definition)
                .await
                .with_context(|| format!("添加配置的作业失败: {}", definition.name))?;
            info!("已添加配置的作业: {} ({})", definition.name, job_id);
        }
        Ok(())
    }

    async fn add_definition(&self, definition: &JobDefinition) -> Result<String> {
        let options = JobOptions {
            max_instances: definition.max_instances,
            misfire_grace_time: definition.misfire_grace_time,
        };
        let job_id = self
            .scheduler
            .add_job(
                &definition.name,
                &definition.function,
                definition.trigger.clone(),
                JobArguments::new(definition.args.clone(), definition.kwargs.clone()),
                options,
            )
            .await?;
        Ok(job_id)
    }
}
