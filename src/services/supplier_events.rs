//! Status, tracking and stock updates pushed by the drop-ship supplier.
//!
//! Shipping is what releases a seller's held distribution, so these updates
//! are the only path that moves an order to `shipped` or `delivered`.

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, Iterable, QueryFilter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{self, FulfillmentStatus};
use crate::entities::supplier_order;
use crate::entities::{product, product_variant};
use crate::errors::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupplierEvent {
    OrderStatus {
        order_number: String,
        status: String,
        supplier_order_id: Option<String>,
    },
    Tracking {
        order_number: String,
        tracking_number: String,
        tracking_url: Option<String>,
    },
    Inventory {
        pid: String,
        vid: Option<String>,
        stock: i32,
    },
    Other {
        event_type: String,
    },
}

fn opt_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required(data: &Value, key: &str) -> Result<String, ServiceError> {
    opt_string(&data[key]).ok_or_else(|| ServiceError::InvalidInput(format!("{} missing", key)))
}

impl SupplierEvent {
    /// Parses `{ eventType, data }` as delivered by CJ.
    pub fn from_envelope(envelope: &Value) -> Result<Self, ServiceError> {
        let event_type = envelope["eventType"]
            .as_str()
            .ok_or_else(|| ServiceError::InvalidInput("eventType missing".to_string()))?;
        let data = &envelope["data"];

        let event = match event_type {
            "ORDER_STATUS_UPDATE" => Self::OrderStatus {
                order_number: required(data, "orderNumber")?,
                status: required(data, "status")?,
                supplier_order_id: opt_string(&data["cjOrderId"]),
            },
            "TRACKING_NUMBER_UPDATE" => Self::Tracking {
                order_number: required(data, "orderNumber")?,
                tracking_number: required(data, "trackingNumber")?,
                tracking_url: opt_string(&data["trackingUrl"]),
            },
            "INVENTORY_UPDATE" => {
                let stock = data["stock"]
                    .as_i64()
                    .or_else(|| data["stock"].as_str().and_then(|s| s.trim().parse().ok()))
                    .ok_or_else(|| ServiceError::InvalidInput("stock missing".to_string()))?;
                Self::Inventory {
                    pid: required(data, "pid")?,
                    vid: opt_string(&data["vid"]),
                    stock: i32::try_from(stock.max(0)).unwrap_or(i32::MAX),
                }
            }
            other => Self::Other {
                event_type: other.to_string(),
            },
        };
        Ok(event)
    }
}

/// Marketplace fulfillment state implied by a supplier order status.
pub fn fulfillment_for_supplier_status(status: &str) -> FulfillmentStatus {
    match status.trim().to_ascii_uppercase().as_str() {
        "SHIPPED" => FulfillmentStatus::Shipped,
        "DELIVERED" => FulfillmentStatus::Delivered,
        "CANCELLED" | "FAILED" => FulfillmentStatus::Failed,
        _ => FulfillmentStatus::Processing,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SupplierEventDisposition {
    Applied {
        order_id: Uuid,
        fulfillment_status: FulfillmentStatus,
        /// False when the order was already past the reported state
        advanced: bool,
    },
    UnknownOrder { order_number: String },
    StockSynced { products: u64, variants: u64 },
    Ignored { event_type: String },
}

#[derive(Clone)]
pub struct SupplierEventService {
    db_pool: Arc<DatabaseConnection>,
}

impl SupplierEventService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, event))]
    pub async fn apply(&self, event: SupplierEvent) -> Result<SupplierEventDisposition, ServiceError> {
        let disposition = match event {
            SupplierEvent::OrderStatus {
                order_number,
                status,
                supplier_order_id,
            } => {
                let target = fulfillment_for_supplier_status(&status);
                let mut update = supplier_order::Entity::update_many()
                    .col_expr(
                        supplier_order::Column::SupplierStatus,
                        Expr::value(status.trim().to_ascii_lowercase()),
                    )
                    .col_expr(supplier_order::Column::UpdatedAt, Expr::value(Utc::now()));
                if let Some(id) = supplier_order_id {
                    update = update.col_expr(supplier_order::Column::SupplierOrderId, Expr::value(id));
                }
                self.apply_to_order(&order_number, update, target).await?
            }
            SupplierEvent::Tracking {
                order_number,
                tracking_number,
                tracking_url,
            } => {
                let update = supplier_order::Entity::update_many()
                    .col_expr(supplier_order::Column::TrackingNumber, Expr::value(tracking_number))
                    .col_expr(supplier_order::Column::TrackingUrl, Expr::value(tracking_url))
                    .col_expr(supplier_order::Column::UpdatedAt, Expr::value(Utc::now()));
                self.apply_to_order(&order_number, update, FulfillmentStatus::Shipped)
                    .await?
            }
            SupplierEvent::Inventory { pid, vid, stock } => self.sync_stock(&pid, vid.as_deref(), stock).await?,
            SupplierEvent::Other { event_type } => {
                debug!(%event_type, "Ignoring supplier event");
                SupplierEventDisposition::Ignored { event_type }
            }
        };
        info!(?disposition, "Supplier event applied");
        Ok(disposition)
    }

    async fn apply_to_order(
        &self,
        order_number: &str,
        update: sea_orm::UpdateMany<supplier_order::Entity>,
        target: FulfillmentStatus,
    ) -> Result<SupplierEventDisposition, ServiceError> {
        let db = &*self.db_pool;
        let Some(row) = supplier_order::Entity::find()
            .filter(supplier_order::Column::SupplierOrderNumber.eq(order_number))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
        else {
            warn!(%order_number, "Supplier event for an unknown order number");
            return Ok(SupplierEventDisposition::UnknownOrder {
                order_number: order_number.to_string(),
            });
        };

        update
            .filter(supplier_order::Column::Id.eq(row.id))
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;

        let advanced = order::Entity::update_many()
            .col_expr(order::Column::FulfillmentStatus, Expr::value(target))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(row.order_id))
            .filter(
                order::Column::FulfillmentStatus
                    .is_in(FulfillmentStatus::iter().filter(|s| s.can_advance_to(target))),
            )
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?
            .rows_affected
            > 0;
        if advanced {
            counter!("settlement.fulfillment.supplier_updates", 1, "status" => target.to_string());
        }

        Ok(SupplierEventDisposition::Applied {
            order_id: row.order_id,
            fulfillment_status: target,
            advanced,
        })
    }

    /// Mirrors supplier stock onto mapped catalogue rows. A variant id narrows
    /// the match to that variant.
    async fn sync_stock(
        &self,
        pid: &str,
        vid: Option<&str>,
        stock: i32,
    ) -> Result<SupplierEventDisposition, ServiceError> {
        let db = &*self.db_pool;
        let now = Utc::now();

        let mut variants = product_variant::Entity::update_many()
            .col_expr(product_variant::Column::StockQuantity, Expr::value(stock))
            .filter(product_variant::Column::CjProductId.eq(pid));
        let mut products = product::Entity::update_many()
            .col_expr(product::Column::StockQuantity, Expr::value(stock))
            .col_expr(product::Column::UpdatedAt, Expr::value(now))
            .filter(product::Column::CjProductId.eq(pid));
        if let Some(vid) = vid {
            variants = variants.filter(product_variant::Column::CjVariantId.eq(vid));
            products = products.filter(product::Column::CjVariantId.eq(vid));
        }

        let variants = variants.exec(db).await.map_err(ServiceError::db_error)?.rows_affected;
        let products = products.exec(db).await.map_err(ServiceError::db_error)?.rows_affected;
        Ok(SupplierEventDisposition::StockSynced { products, variants })
    }
}
