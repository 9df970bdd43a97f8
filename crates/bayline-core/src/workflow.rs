//! Job status state machine and the staff sub-workflows gated by status.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    Actor, ChecklistItem, HistoryEvent, IssueType, Job, NoShow, NoShowReason, NoShowResolution,
    Payment, PaymentStatus, PhotoMeta, PostCompletionIssue, Role, StaffPatch, StatusHistoryEntry,
    VehicleInfo, WorkStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: WorkStatus, to: WorkStatus },
    #[error("{operation} requires a manager-level role, actor has {role}")]
    Forbidden { operation: &'static str, role: Role },
    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("job status changed concurrently: expected {expected}, found {actual}")]
    StaleState {
        expected: WorkStatus,
        actual: WorkStatus,
    },
}

impl JobError {
    fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// A photo the client already uploaded to object storage and now commits to the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoUpload {
    pub key: String,
    pub content_type: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobCommand {
    ChangeStatus {
        to: WorkStatus,
        reason: Option<String>,
    },
    MarkNoShow {
        reason: NoShowReason,
        notes: Option<String>,
    },
    ResolveNoShow {
        resolution: NoShowResolution,
        notes: Option<String>,
    },
    OpenIssue {
        issue_type: IssueType,
        notes: Option<String>,
    },
    ResolveIssue {
        notes: Option<String>,
    },
    SetPayment {
        status: PaymentStatus,
        method: Option<String>,
        reason: Option<String>,
    },
    AddReceiptPhoto(PhotoUpload),
    AddPhoto(PhotoUpload),
    UpdateChecklist(Vec<ChecklistItem>),
    UpdateVehicleInfo(VehicleInfo),
    UpdateNotes(String),
}

impl JobCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChangeStatus { .. } => "change_status",
            Self::MarkNoShow { .. } => "mark_no_show",
            Self::ResolveNoShow { .. } => "resolve_no_show",
            Self::OpenIssue { .. } => "open_issue",
            Self::ResolveIssue { .. } => "resolve_issue",
            Self::SetPayment { .. } => "set_payment",
            Self::AddReceiptPhoto(_) => "add_receipt_photo",
            Self::AddPhoto(_) => "add_photo",
            Self::UpdateChecklist(_) => "update_checklist",
            Self::UpdateVehicleInfo(_) => "update_vehicle_info",
            Self::UpdateNotes(_) => "update_notes",
        }
    }
}

/// Pure rule set for staff-authored writes.
///
/// [`JobStateMachine::apply`] never mutates the job; it returns the [`StaffPatch`] a
/// store should apply, already carrying the single audit entry for the operation.
pub struct JobStateMachine;

impl JobStateMachine {
    /// Whether a plain status change `from -> to` is legal.
    ///
    /// `WORK_COMPLETED` is only reachable from `QC_READY` and never left. The no-show
    /// states are entered and left through their own commands, not status changes.
    pub fn can_transition(from: WorkStatus, to: WorkStatus) -> bool {
        if from == to || from.is_terminal() {
            return false;
        }
        match to {
            WorkStatus::WorkCompleted => from == WorkStatus::QcReady,
            WorkStatus::NoShow | WorkStatus::NoShowResolved => false,
            _ => from.is_active() && to.is_active(),
        }
    }

    pub fn apply(
        job: &Job,
        command: JobCommand,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<StaffPatch, JobError> {
        let current = job.work_status;
        let entry = |event, from, to, reason| StatusHistoryEntry {
            from,
            to,
            event,
            changed_by: actor.clone(),
            changed_at: now,
            reason,
        };

        match command {
            JobCommand::ChangeStatus { to, reason } => {
                if !Self::can_transition(current, to) {
                    return Err(JobError::InvalidTransition { from: current, to });
                }
                let mut patch = StaffPatch::new(
                    current,
                    entry(HistoryEvent::StatusChanged, Some(current), Some(to), non_blank(reason)),
                );
                patch.work_status = Some(to);
                Ok(patch)
            }
            JobCommand::MarkNoShow { reason, notes } => {
                if !current.allows_no_show() {
                    return Err(JobError::InvalidTransition {
                        from: current,
                        to: WorkStatus::NoShow,
                    });
                }
                let notes = non_blank(notes);
                if reason == NoShowReason::Other && notes.is_none() {
                    return Err(JobError::validation("no-show reason OTHER requires notes"));
                }
                let mut patch = StaffPatch::new(
                    current,
                    entry(
                        HistoryEvent::NoShowMarked,
                        Some(current),
                        Some(WorkStatus::NoShow),
                        Some(reason.as_str().to_string()),
                    ),
                );
                patch.work_status = Some(WorkStatus::NoShow);
                patch.no_show = Some(NoShow {
                    is_open: true,
                    reason,
                    notes,
                    previous_status: current,
                    marked_at: now,
                    marked_by: actor.clone(),
                    resolved_at: None,
                    resolved_by: None,
                    resolution: None,
                });
                Ok(patch)
            }
            JobCommand::ResolveNoShow { resolution, notes } => {
                let Some(open) = job.no_show.as_ref().filter(|no_show| no_show.is_open) else {
                    return Err(JobError::precondition("no open no-show to resolve"));
                };
                let to = match resolution {
                    NoShowResolution::Reinstated => open.previous_status,
                    NoShowResolution::Closed => WorkStatus::NoShowResolved,
                };
                let mut resolved = open.clone();
                resolved.is_open = false;
                resolved.resolved_at = Some(now);
                resolved.resolved_by = Some(actor.clone());
                resolved.resolution = Some(resolution);
                if let Some(notes) = non_blank(notes.clone()) {
                    resolved.notes = Some(notes);
                }

                let mut patch = StaffPatch::new(
                    current,
                    entry(HistoryEvent::NoShowResolved, Some(current), Some(to), non_blank(notes)),
                );
                patch.work_status = Some(to);
                patch.no_show = Some(resolved);
                Ok(patch)
            }
            JobCommand::OpenIssue { issue_type, notes } => {
                require_manager("open_issue", actor)?;
                if current != WorkStatus::WorkCompleted {
                    return Err(JobError::precondition(format!(
                        "issues can only be opened on {} jobs, job is {current}",
                        WorkStatus::WorkCompleted
                    )));
                }
                if job.has_open_issue() {
                    return Err(JobError::precondition("an issue is already open for this job"));
                }
                let notes = non_blank(notes);
                if issue_type == IssueType::Other && notes.is_none() {
                    return Err(JobError::validation("issue type OTHER requires notes"));
                }
                let mut patch = StaffPatch::new(
                    current,
                    entry(HistoryEvent::IssueOpened, None, None, notes.clone()),
                );
                patch.post_completion_issue = Some(PostCompletionIssue {
                    is_open: true,
                    issue_type,
                    notes,
                    opened_at: now,
                    opened_by: actor.clone(),
                    resolved_at: None,
                    resolved_by: None,
                    resolution_notes: None,
                });
                Ok(patch)
            }
            JobCommand::ResolveIssue { notes } => {
                require_manager("resolve_issue", actor)?;
                let Some(open) = job
                    .post_completion_issue
                    .as_ref()
                    .filter(|issue| issue.is_open)
                else {
                    return Err(JobError::precondition("no open issue to resolve"));
                };
                let notes = non_blank(notes);
                let mut resolved = open.clone();
                resolved.is_open = false;
                resolved.resolved_at = Some(now);
                resolved.resolved_by = Some(actor.clone());
                resolved.resolution_notes = notes.clone();

                let mut patch =
                    StaffPatch::new(current, entry(HistoryEvent::IssueResolved, None, None, notes));
                patch.post_completion_issue = Some(resolved);
                Ok(patch)
            }
            JobCommand::SetPayment {
                status,
                method,
                reason,
            } => {
                require_manager("set_payment", actor)?;
                let reason = non_blank(reason);
                let event = match status {
                    PaymentStatus::Paid => {
                        if job.receipt_photos.is_empty() {
                            return Err(JobError::precondition(
                                "marking a job paid requires at least one receipt photo",
                            ));
                        }
                        HistoryEvent::PaymentMarkedPaid
                    }
                    PaymentStatus::Unpaid => {
                        if reason.is_none() {
                            return Err(JobError::validation(
                                "marking a job unpaid requires a reason",
                            ));
                        }
                        HistoryEvent::PaymentMarkedUnpaid
                    }
                };
                let mut patch = StaffPatch::new(current, entry(event, None, None, reason.clone()));
                patch.payment = Some(Payment {
                    status,
                    method: non_blank(method),
                    reason,
                    updated_at: Some(now),
                    updated_by: Some(actor.clone()),
                });
                Ok(patch)
            }
            JobCommand::AddReceiptPhoto(upload) => {
                let photo = photo_meta(upload, actor, now)?;
                let mut photos = job.receipt_photos.clone();
                photos.push(photo);
                let mut patch = StaffPatch::new(
                    current,
                    entry(HistoryEvent::ReceiptPhotoAdded, None, None, None),
                );
                patch.receipt_photos = Some(photos);
                Ok(patch)
            }
            JobCommand::AddPhoto(upload) => {
                let photo = photo_meta(upload, actor, now)?;
                let mut photos = job.photos_meta.clone();
                photos.push(photo);
                let mut patch =
                    StaffPatch::new(current, entry(HistoryEvent::PhotoAdded, None, None, None));
                patch.photos_meta = Some(photos);
                Ok(patch)
            }
            JobCommand::UpdateChecklist(items) => {
                if items.iter().any(|item| item.id.trim().is_empty()) {
                    return Err(JobError::validation("checklist items require an id"));
                }
                let mut patch = StaffPatch::new(
                    current,
                    entry(HistoryEvent::ChecklistUpdated, None, None, None),
                );
                patch.checklist = Some(items);
                Ok(patch)
            }
            JobCommand::UpdateVehicleInfo(vehicle) => {
                let mut patch = StaffPatch::new(
                    current,
                    entry(HistoryEvent::VehicleInfoUpdated, None, None, None),
                );
                patch.vehicle_info = Some(vehicle);
                Ok(patch)
            }
            JobCommand::UpdateNotes(notes) => {
                let mut patch =
                    StaffPatch::new(current, entry(HistoryEvent::NotesUpdated, None, None, None));
                patch.notes = Some(notes);
                Ok(patch)
            }
        }
    }
}

fn require_manager(operation: &'static str, actor: &Actor) -> Result<(), JobError> {
    if actor.role.is_manager() {
        Ok(())
    } else {
        Err(JobError::Forbidden {
            operation,
            role: actor.role,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn photo_meta(
    upload: PhotoUpload,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<PhotoMeta, JobError> {
    let key = upload.key.trim().to_string();
    if key.is_empty() {
        return Err(JobError::validation("photo key must not be empty"));
    }
    Ok(PhotoMeta {
        key,
        content_type: non_blank(upload.content_type),
        caption: non_blank(upload.caption),
        uploaded_at: now,
        uploaded_by: actor.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BookingStatus, JobUpdate, ParsedBooking};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().unwrap()
    }

    fn tech() -> Actor {
        Actor::new("u-tech", "Tess Tech", Role::Technician)
    }

    fn manager() -> Actor {
        Actor::new("u-mgr", "Max Manager", Role::Manager)
    }

    fn job_in(status: WorkStatus) -> Job {
        let booking = ParsedBooking {
            booking_id: "bk_1".into(),
            customer_id: None,
            service_type: Some("Full Detail".into()),
            appointment_time: Some(now()),
            status: Some(BookingStatus::Accepted),
            location_id: None,
            notes: None,
            version: None,
        };
        let mut job = Job::from_booking(&booking, "square-webhook", now());
        job.work_status = status;
        job
    }

    /// Applies a command the way a store would and returns the updated job.
    fn run(job: &Job, command: JobCommand, actor: &Actor) -> Result<Job, JobError> {
        let patch = JobStateMachine::apply(job, command, actor, now())?;
        let mut next = job.clone();
        JobUpdate::Staff(patch).apply_to(&mut next, now())?;
        Ok(next)
    }

    fn to(status: WorkStatus) -> JobCommand {
        JobCommand::ChangeStatus {
            to: status,
            reason: None,
        }
    }

    fn receipt() -> JobCommand {
        JobCommand::AddReceiptPhoto(PhotoUpload {
            key: "receipts/bk_1/1.jpg".into(),
            content_type: Some("image/jpeg".into()),
            caption: None,
        })
    }

    #[test]
    fn forward_and_backward_moves_among_active_states() {
        let job = job_in(WorkStatus::Scheduled);
        let job = run(&job, to(WorkStatus::InProgress), &tech()).unwrap();
        assert_eq!(job.work_status, WorkStatus::InProgress);
        let job = run(
            &job,
            JobCommand::ChangeStatus {
                to: WorkStatus::CheckedIn,
                reason: Some("premature".into()),
            },
            &tech(),
        )
        .unwrap();
        assert_eq!(job.work_status, WorkStatus::CheckedIn);
        let last = job.status_history.last().unwrap();
        assert_eq!(last.from, Some(WorkStatus::InProgress));
        assert_eq!(last.to, Some(WorkStatus::CheckedIn));
        assert_eq!(last.reason.as_deref(), Some("premature"));
    }

    #[test]
    fn completion_requires_qc_ready() {
        let job = job_in(WorkStatus::InProgress);
        let err = run(&job, to(WorkStatus::WorkCompleted), &tech()).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                from: WorkStatus::InProgress,
                to: WorkStatus::WorkCompleted,
            }
        );
        let job = job_in(WorkStatus::QcReady);
        let job = run(&job, to(WorkStatus::WorkCompleted), &tech()).unwrap();
        assert_eq!(job.work_status, WorkStatus::WorkCompleted);
    }

    #[test]
    fn completed_job_cannot_go_back_to_qc_ready_even_for_admins() {
        let job = job_in(WorkStatus::WorkCompleted);
        let admin = Actor::new("u-admin", "Ada", Role::Admin);
        let err = run(&job, to(WorkStatus::QcReady), &admin).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition { from: WorkStatus::WorkCompleted, to: WorkStatus::QcReady }
        );
    }

    #[test]
    fn no_show_only_from_early_states() {
        for status in [WorkStatus::Scheduled, WorkStatus::CheckedIn, WorkStatus::InProgress] {
            let job = run(
                &job_in(status),
                JobCommand::MarkNoShow { reason: NoShowReason::CustomerDidNotArrive, notes: None },
                &tech(),
            )
            .unwrap();
            assert_eq!(job.work_status, WorkStatus::NoShow);
            assert!(job.has_open_no_show());
        }
        for status in [WorkStatus::QcReady, WorkStatus::WorkCompleted] {
            let err = run(
                &job_in(status),
                JobCommand::MarkNoShow { reason: NoShowReason::CustomerDidNotArrive, notes: None },
                &tech(),
            )
            .unwrap_err();
            assert_eq!(err, JobError::InvalidTransition { from: status, to: WorkStatus::NoShow });
        }
    }

    #[test]
    fn no_show_other_requires_notes() {
        let err = run(
            &job_in(WorkStatus::Scheduled),
            JobCommand::MarkNoShow { reason: NoShowReason::Other, notes: Some("  ".into()) },
            &tech(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Validation { .. }));
    }

    #[test]
    fn resolving_no_show_requires_an_open_one() {
        let err = run(
            &job_in(WorkStatus::Scheduled),
            JobCommand::ResolveNoShow { resolution: NoShowResolution::Closed, notes: None },
            &tech(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::PreconditionFailed { .. }));
    }

    #[test]
    fn reinstated_no_show_returns_to_previous_status() {
        let job = run(
            &job_in(WorkStatus::CheckedIn),
            JobCommand::MarkNoShow { reason: NoShowReason::VehicleUnavailable, notes: None },
            &tech(),
        )
        .unwrap();
        let job = run(
            &job,
            JobCommand::ResolveNoShow {
                resolution: NoShowResolution::Reinstated,
                notes: Some("arrived late".into()),
            },
            &tech(),
        )
        .unwrap();
        assert_eq!(job.work_status, WorkStatus::CheckedIn);
        let no_show = job.no_show.as_ref().unwrap();
        assert!(!no_show.is_open);
        assert_eq!(no_show.resolution, Some(NoShowResolution::Reinstated));

        let err = run(
            &job,
            JobCommand::ResolveNoShow { resolution: NoShowResolution::Closed, notes: None },
            &tech(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::PreconditionFailed { .. }));
    }

    #[test]
    fn closed_no_show_blocks_status_changes() {
        let job = run(
            &job_in(WorkStatus::Scheduled),
            JobCommand::MarkNoShow { reason: NoShowReason::LateCancellation, notes: None },
            &tech(),
        )
        .unwrap();
        let job = run(
            &job,
            JobCommand::ResolveNoShow { resolution: NoShowResolution::Closed, notes: None },
            &tech(),
        )
        .unwrap();
        assert_eq!(job.work_status, WorkStatus::NoShowResolved);
        let err = run(&job, to(WorkStatus::Scheduled), &tech()).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[test]
    fn issue_lifecycle_is_manager_only_and_single_open() {
        let job = job_in(WorkStatus::WorkCompleted);
        let open = || JobCommand::OpenIssue {
            issue_type: IssueType::Damage,
            notes: Some("scratch on door".into()),
        };

        let err = run(&job, open(), &tech()).unwrap_err();
        assert_eq!(err, JobError::Forbidden { operation: "open_issue", role: Role::Technician });

        let job = run(&job, open(), &manager()).unwrap();
        assert!(job.has_open_issue());
        let entry = job.status_history.last().unwrap();
        assert_eq!(entry.event, HistoryEvent::IssueOpened);
        assert_eq!(entry.from, None);
        assert_eq!(entry.to, None);
        assert_eq!(job.work_status, WorkStatus::WorkCompleted);

        let err = run(&job, open(), &manager()).unwrap_err();
        assert!(matches!(err, JobError::PreconditionFailed { .. }));

        let resolve = JobCommand::ResolveIssue {
            notes: Some("touched up".into()),
        };
        let job = run(&job, resolve, &manager()).unwrap();
        assert!(!job.has_open_issue());
        let err = run(&job, JobCommand::ResolveIssue { notes: None }, &manager()).unwrap_err();
        assert!(matches!(err, JobError::PreconditionFailed { .. }));

        // A new lifecycle may start once the previous one is closed.
        let job = run(&job, open(), &manager()).unwrap();
        assert!(job.has_open_issue());
    }

    #[test]
    fn issues_need_a_completed_job() {
        let err = run(
            &job_in(WorkStatus::QcReady),
            JobCommand::OpenIssue { issue_type: IssueType::MissedArea, notes: None },
            &manager(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::PreconditionFailed { .. }));
    }

    #[test]
    fn payment_rules() {
        let job = job_in(WorkStatus::WorkCompleted);
        let paid = || JobCommand::SetPayment {
            status: PaymentStatus::Paid,
            method: Some("card".into()),
            reason: None,
        };

        let err = run(&job, paid(), &manager()).unwrap_err();
        assert!(matches!(err, JobError::PreconditionFailed { .. }));

        let job = run(&job, receipt(), &tech()).unwrap();
        let err = run(&job, paid(), &tech()).unwrap_err();
        assert!(matches!(err, JobError::Forbidden { .. }));

        let job = run(&job, paid(), &manager()).unwrap();
        assert_eq!(job.payment.status, PaymentStatus::Paid);
        assert_eq!(job.status_history.last().unwrap().event, HistoryEvent::PaymentMarkedPaid);

        let err = run(
            &job,
            JobCommand::SetPayment { status: PaymentStatus::Unpaid, method: None, reason: None },
            &manager(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Validation { .. }));

        let job = run(
            &job,
            JobCommand::SetPayment {
                status: PaymentStatus::Unpaid,
                method: None,
                reason: Some("card declined".into()),
            },
            &manager(),
        )
        .unwrap();
        assert_eq!(job.payment.status, PaymentStatus::Unpaid);
        assert_eq!(job.payment.reason.as_deref(), Some("card declined"));
    }

    #[test]
    fn every_accepted_operation_appends_exactly_one_entry() {
        let job = job_in(WorkStatus::Scheduled);
        let commands = vec![
            JobCommand::UpdateNotes("customer wants tire shine".into()),
            JobCommand::UpdateVehicleInfo(VehicleInfo {
                make: Some("Mazda".into()),
                ..VehicleInfo::default()
            }),
            JobCommand::UpdateChecklist(vec![ChecklistItem {
                id: "vac".into(),
                label: "Vacuum".into(),
                done: true,
            }]),
            JobCommand::AddPhoto(PhotoUpload {
                key: "before/1.jpg".into(),
                content_type: None,
                caption: None,
            }),
            to(WorkStatus::CheckedIn),
        ];
        let mut current = job;
        for command in commands {
            let before = current.status_history.len();
            current = run(&current, command, &tech()).unwrap();
            assert_eq!(current.status_history.len(), before + 1);
        }
    }

    #[test]
    fn empty_photo_key_is_rejected() {
        let err = run(
            &job_in(WorkStatus::Scheduled),
            JobCommand::AddReceiptPhoto(PhotoUpload {
                key: " ".into(),
                content_type: None,
                caption: None,
            }),
            &tech(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Validation { .. }));
    }

    fn arb_command() -> impl Strategy<Value = JobCommand> {
        let status = prop::sample::select(vec![
            WorkStatus::Scheduled,
            WorkStatus::CheckedIn,
            WorkStatus::InProgress,
            WorkStatus::QcReady,
            WorkStatus::WorkCompleted,
            WorkStatus::NoShow,
            WorkStatus::NoShowResolved,
        ]);
        prop_oneof![
            status.prop_map(to),
            Just(JobCommand::MarkNoShow {
                reason: NoShowReason::CustomerDidNotArrive,
                notes: None,
            }),
            Just(JobCommand::ResolveNoShow {
                resolution: NoShowResolution::Reinstated,
                notes: None,
            }),
            Just(JobCommand::ResolveNoShow { resolution: NoShowResolution::Closed, notes: None }),
            Just(JobCommand::OpenIssue { issue_type: IssueType::Damage, notes: None }),
            Just(JobCommand::ResolveIssue { notes: None }),
            Just(receipt()),
        ]
    }

    proptest! {
        #[test]
        fn work_completed_is_never_left(commands in prop::collection::vec(arb_command(), 1..40)) {
            let mut job = job_in(WorkStatus::Scheduled);
            let mut completed = false;
            for command in commands {
                if let Ok(next) = run(&job, command, &manager()) {
                    job = next;
                }
                if completed {
                    prop_assert_eq!(job.work_status, WorkStatus::WorkCompleted);
                }
                completed |= job.work_status == WorkStatus::WorkCompleted;
            }
        }
    }
}
