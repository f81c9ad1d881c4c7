//! Triggering and scheduling of the job that copies published rows to offline storage.
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};

use crate::{
    checkpoint::Checkpoint,
    collaborators::{wait_for_completion, Job, MaterializationJob, OnlineIngestionApi},
    feature_group::FeatureGroup,
    write_options::{BackfillInterval, WriteOptions},
    Error, Result,
};

/// Seconds between the first run of the job and the first scheduled run.
const SCHEDULE_START_DELAY_SECS: i64 = 2;

impl BackfillInterval {
    /// Quartz cron expression of the interval. Hour intervals are anchored at `now`.
    ///
    /// ```
    /// # use chrono::{TimeZone, Utc};
    /// # use featurestore_core::write_options::BackfillInterval;
    /// let now = Utc.with_ymd_and_hms(2024, 5, 1, 7, 30, 15).unwrap();
    /// assert_eq!(BackfillInterval::Hours(6).cron_expression(now), "15 30 7/6 ? * * *");
    /// ```
    pub fn cron_expression(&self, now: DateTime<Utc>) -> String {
        match self {
            BackfillInterval::Cron(expression) => expression.clone(),
            BackfillInterval::Hours(hours) => format!(
                "{} {} {}/{} ? * * *",
                now.second(),
                now.minute(),
                now.hour(),
                hours
            ),
        }
    }
}

/// Arguments of a job run: the job's default arguments, plus the resume checkpoint if any.
pub fn job_args(default_args: &str, checkpoint: Option<&Checkpoint>) -> String {
    match checkpoint {
        Some(checkpoint) if !checkpoint.offsets.is_empty() => {
            format!("{default_args} -initialCheckPointString {checkpoint}")
        }
        _ => default_args.to_owned(),
    }
}

/// Decides whether and how to run the materialization job once a dataframe was published.
pub struct MaterializationCoordinator<'a> {
    jobs: &'a dyn MaterializationJob,
    online_ingestions: &'a dyn OnlineIngestionApi,
}

impl<'a> MaterializationCoordinator<'a> {
    pub fn new(
        jobs: &'a dyn MaterializationJob,
        online_ingestions: &'a dyn OnlineIngestionApi,
    ) -> MaterializationCoordinator<'a> {
        MaterializationCoordinator {
            jobs,
            online_ingestions,
        }
    }

    /// Run the job of `fg` after a batch was published.
    ///
    /// `checkpoint_before` holds the high watermarks captured before publishing, `None` if the
    /// topic did not exist or the batch is a part of a multi-part insert. `low_watermarks` is only
    /// called when the topic did not exist before the batch.
    ///
    /// 1. If the topic did not exist and this is not a multi-part insert, the job always runs from
    ///    the low watermarks, and is scheduled if a backfill interval is set.
    /// 2. Otherwise the job runs if offline materialization is requested, resuming from
    ///    `checkpoint_before` unless `skip_offsets` is set or the job never ran before.
    ///
    /// Returns the job of the feature group, `None` for external feature groups, which have no
    /// offline storage to materialize to.
    pub fn after_batch(
        &self,
        fg: &FeatureGroup,
        checkpoint_before: Option<&Checkpoint>,
        low_watermarks: impl FnOnce() -> Result<Option<Checkpoint>>,
        multi_part: bool,
        options: &WriteOptions,
    ) -> Result<Option<Job>> {
        if fg.external {
            return Ok(None);
        }
        let job = fg.materialization_job.as_ref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "feature group '{}' has no materialization job",
                fg.name
            ))
        })?;

        if checkpoint_before.is_none() && !multi_part {
            if !options.start_offline_materialization() {
                log::warn!(target: "featurestore", feature_group = fg.name.as_str();
                    "first ingestion into a new topic, running materialization job although offline materialization was disabled");
            }

            let low = low_watermarks()?;
            let now = Utc::now();
            self.run(fg, job, job_args(self.jobs.default_args(job), low.as_ref()), options)?;

            match &options.offline_backfill_every_hr {
                Some(interval) => {
                    let cron_expression = interval.cron_expression(now);
                    let start_time = now + ChronoDuration::seconds(SCHEDULE_START_DELAY_SECS);
                    self.jobs.schedule(job, &cron_expression, start_time)?;
                    log::info!(target: "featurestore",
                        feature_group = fg.name.as_str(), job = job.name.as_str(), cron = cron_expression.as_str();
                        "scheduled materialization job");
                }
                None => log::info!(target: "featurestore",
                    feature_group = fg.name.as_str(), job = job.name.as_str();
                    "materialization job was not scheduled"),
            }
        } else if options.start_offline_materialization() {
            let resume_from = if options.skip_offsets || self.jobs.last_execution(job)?.is_none() {
                None
            } else {
                checkpoint_before
            };
            self.run(fg, job, job_args(self.jobs.default_args(job), resume_from), options)?;
        }

        if fg.online_enabled && options.wait_for_online_ingestion {
            match self.online_ingestions.latest(fg)? {
                Some(ingestion) => {
                    wait_for_completion(
                        self.online_ingestions,
                        fg,
                        ingestion,
                        &options.online_ingestion_options,
                    )?;
                }
                None => log::warn!(target: "featurestore", feature_group = fg.name.as_str();
                    "no online ingestion to wait for"),
            }
        }

        Ok(Some(job.clone()))
    }

    fn run(&self, fg: &FeatureGroup, job: &Job, args: String, options: &WriteOptions) -> Result<()> {
        log::info!(target: "featurestore",
            feature_group = fg.name.as_str(), job = job.name.as_str(), args = args.as_str(), wait = options.wait_for_job(false);
            "running materialization job");
        self.jobs.run(job, &args, options.wait_for_job(false))?;
        Ok(())
    }
}
