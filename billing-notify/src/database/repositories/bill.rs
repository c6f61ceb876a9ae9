//! Bill repository.
//!
//! Read by the retry job to rebuild wire messages with the current amounts.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::Result;
use crate::database::MAX_BULK_ROWS;
use crate::database::models::BillDbModel;

#[async_trait]
pub trait BillRepository: Send + Sync {
    async fn find(&self, bill_id: i64) -> Result<Option<BillDbModel>>;
    /// Bulk lookup keyed by bill id; unknown ids are simply absent.
    async fn find_many(&self, bill_ids: &[i64]) -> Result<HashMap<i64, BillDbModel>>;
    async fn upsert(&self, bill: &BillDbModel) -> Result<()>;
}

pub struct SqlxBillRepository {
    pool: SqlitePool,
}

impl SqlxBillRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillRepository for SqlxBillRepository {
    async fn find(&self, bill_id: i64) -> Result<Option<BillDbModel>> {
        let bill = sqlx::query_as::<_, BillDbModel>("SELECT * FROM bill WHERE bill_id = ?")
            .bind(bill_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(bill)
    }

    async fn find_many(&self, bill_ids: &[i64]) -> Result<HashMap<i64, BillDbModel>> {
        let mut bills = HashMap::with_capacity(bill_ids.len());
        for chunk in bill_ids.chunks(MAX_BULK_ROWS) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT * FROM bill WHERE bill_id IN (");
            {
                let mut ids = qb.separated(", ");
                for id in chunk {
                    ids.push_bind(*id);
                }
            }
            qb.push(")");

            let rows = qb
                .build_query_as::<BillDbModel>()
                .fetch_all(&self.pool)
                .await?;
            bills.extend(rows.into_iter().map(|bill| (bill.bill_id, bill)));
        }
        Ok(bills)
    }

    async fn upsert(&self, bill: &BillDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bill (
                bill_id, user_id, billing_year_month, bill_date, due_date,
                total_amount, recipient_name, recipient_email, recipient_phone, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bill_id) DO UPDATE SET
                user_id = excluded.user_id,
                billing_year_month = excluded.billing_year_month,
                bill_date = excluded.bill_date,
                due_date = excluded.due_date,
                total_amount = excluded.total_amount,
                recipient_name = excluded.recipient_name,
                recipient_email = excluded.recipient_email,
                recipient_phone = excluded.recipient_phone,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(bill.bill_id)
        .bind(bill.user_id)
        .bind(&bill.billing_year_month)
        .bind(&bill.bill_date)
        .bind(&bill.due_date)
        .bind(bill.total_amount)
        .bind(&bill.recipient_name)
        .bind(&bill.recipient_email)
        .bind(&bill.recipient_phone)
        .bind(bill.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
