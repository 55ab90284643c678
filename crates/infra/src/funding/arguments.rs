use serde::{Deserialize, Serialize};

use fundflow_core::{AccountId, BankAccountId, FundingScheduleId};

use crate::repository::ProcessFundingSchedulesItem;

/// Job envelope: the due schedules of one bank account, processed in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFundingScheduleArguments {
    pub account_id: AccountId,
    pub bank_account_id: BankAccountId,
    pub funding_schedule_ids: Vec<FundingScheduleId>,
}

impl From<ProcessFundingSchedulesItem> for ProcessFundingScheduleArguments {
    fn from(item: ProcessFundingSchedulesItem) -> Self {
        Self {
            account_id: item.account_id,
            bank_account_id: item.bank_account_id,
            funding_schedule_ids: item.funding_schedule_ids,
        }
    }
}
