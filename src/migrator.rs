use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_catalog_tables::Migration),
            Box::new(m20240601_000002_create_checkout_and_order_tables::Migration),
            Box::new(m20240601_000003_create_ledger_tables::Migration),
            Box::new(m20240601_000004_create_supplier_tables::Migration),
        ]
    }
}

mod m20240601_000001_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Profiles::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Profiles::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Profiles::Role).string_len(32).not_null())
                        .col(ColumnDef::new(Profiles::FullName).string().null())
                        .col(ColumnDef::new(Profiles::Email).string().null())
                        .col(ColumnDef::new(Profiles::PaymentAccountId).string().null())
                        .col(ColumnDef::new(Profiles::PaymentAccountStatus).string_len(32).null())
                        .col(ColumnDef::new(Profiles::SellerVerificationStatus).string_len(32).null())
                        .col(ColumnDef::new(Profiles::IdentityVerificationStatus).string_len(32).null())
                        .col(ColumnDef::new(Profiles::ReferredByAffiliateId).uuid().null())
                        .col(
                            ColumnDef::new(Profiles::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Products::SellerId).uuid().not_null())
                        .col(ColumnDef::new(Products::Title).string().not_null())
                        .col(ColumnDef::new(Products::SellerAskCents).big_integer().not_null())
                        .col(
                            ColumnDef::new(Products::CommissionType)
                                .string_len(16)
                                .not_null()
                                .default("percentage"),
                        )
                        .col(
                            ColumnDef::new(Products::CommissionRate)
                                .double()
                                .not_null()
                                .default(0.0),
                        )
                        .col(
                            ColumnDef::new(Products::FlatCommissionCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Products::StockQuantity).integer().null())
                        .col(
                            ColumnDef::new(Products::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::IsPromotable)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::SalesCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Products::CjProductId).string().null())
                        .col(ColumnDef::new(Products::CjVariantId).string().null())
                        .col(ColumnDef::new(Products::SupplierCostCents).big_integer().null())
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_seller_id")
                        .table(Products::Table)
                        .col(Products::SellerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProductVariants::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductVariants::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(ProductVariants::ProductId).uuid().not_null())
                        .col(ColumnDef::new(ProductVariants::Title).string().not_null())
                        .col(ColumnDef::new(ProductVariants::PriceCents).big_integer().not_null())
                        .col(ColumnDef::new(ProductVariants::StockQuantity).integer().null())
                        .col(
                            ColumnDef::new(ProductVariants::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(ColumnDef::new(ProductVariants::CjProductId).string().null())
                        .col(ColumnDef::new(ProductVariants::CjVariantId).string().null())
                        .col(ColumnDef::new(ProductVariants::SupplierCostCents).big_integer().null())
                        .col(
                            ColumnDef::new(ProductVariants::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_product_variants_product")
                                .from(ProductVariants::Table, ProductVariants::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_product_variants_cj_variant_id")
                        .table(ProductVariants::Table)
                        .col(ProductVariants::CjVariantId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProductVariants::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Profiles::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Profiles {
        Table,
        Id,
        Role,
        FullName,
        Email,
        PaymentAccountId,
        PaymentAccountStatus,
        SellerVerificationStatus,
        IdentityVerificationStatus,
        ReferredByAffiliateId,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        SellerId,
        Title,
        SellerAskCents,
        CommissionType,
        CommissionRate,
        FlatCommissionCents,
        StockQuantity,
        IsActive,
        IsPromotable,
        SalesCount,
        CjProductId,
        CjVariantId,
        SupplierCostCents,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum ProductVariants {
        Table,
        Id,
        ProductId,
        Title,
        PriceCents,
        StockQuantity,
        IsActive,
        CjProductId,
        CjVariantId,
        SupplierCostCents,
        CreatedAt,
    }
}

mod m20240601_000002_create_checkout_and_order_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_checkout_and_order_tables"
        }
    }

    fn cents(col: CheckoutIntents) -> ColumnDef {
        ColumnDef::new(col).big_integer().not_null().default(0).to_owned()
    }

    fn order_cents(col: Orders) -> ColumnDef {
        ColumnDef::new(col).big_integer().not_null().default(0).to_owned()
    }

    fn item_cents(col: OrderItems) -> ColumnDef {
        ColumnDef::new(col).big_integer().not_null().default(0).to_owned()
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CheckoutIntents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CheckoutIntents::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CheckoutIntents::SellerId).uuid().not_null())
                        .col(ColumnDef::new(CheckoutIntents::BuyerId).uuid().null())
                        .col(ColumnDef::new(CheckoutIntents::AffiliateId).uuid().null())
                        .col(ColumnDef::new(CheckoutIntents::ReferrerId).uuid().null())
                        .col(ColumnDef::new(CheckoutIntents::FundraiserId).uuid().null())
                        .col(ColumnDef::new(CheckoutIntents::StoreId).uuid().null())
                        .col(ColumnDef::new(CheckoutIntents::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(CheckoutIntents::LineItems).json().not_null())
                        .col(cents(CheckoutIntents::ItemsSubtotalCents))
                        .col(cents(CheckoutIntents::AffiliateFeeCents))
                        .col(cents(CheckoutIntents::PlatformFeeCents))
                        .col(cents(CheckoutIntents::RefOrFundraiserFeeCents))
                        .col(cents(CheckoutIntents::ShippingCents))
                        .col(cents(CheckoutIntents::TaxCents))
                        .col(cents(CheckoutIntents::ProcessingFeeCents))
                        .col(cents(CheckoutIntents::SellerTransferCents))
                        .col(cents(CheckoutIntents::TotalCents))
                        .col(ColumnDef::new(CheckoutIntents::AffiliateRateBps).integer().null())
                        .col(ColumnDef::new(CheckoutIntents::SplitVersion).string_len(16).not_null())
                        .col(ColumnDef::new(CheckoutIntents::SplitJson).json().not_null())
                        .col(
                            ColumnDef::new(CheckoutIntents::Status)
                                .string_len(16)
                                .not_null()
                                .default("created"),
                        )
                        .col(ColumnDef::new(CheckoutIntents::ProviderSessionId).string().null())
                        .col(
                            ColumnDef::new(CheckoutIntents::ProviderPaymentIntentId)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutIntents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutIntents::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_intents_session")
                        .table(CheckoutIntents::Table)
                        .col(CheckoutIntents::ProviderSessionId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(Orders::CheckoutIntentId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::SellerId).uuid().not_null())
                        .col(ColumnDef::new(Orders::BuyerId).uuid().null())
                        .col(ColumnDef::new(Orders::AffiliateId).uuid().null())
                        .col(ColumnDef::new(Orders::ReferrerId).uuid().null())
                        .col(ColumnDef::new(Orders::FundraiserId).uuid().null())
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(order_cents(Orders::ItemsSubtotalCents))
                        .col(order_cents(Orders::ShippingCents))
                        .col(order_cents(Orders::TaxCents))
                        .col(order_cents(Orders::AffiliateFeeCents))
                        .col(order_cents(Orders::PlatformFeeCents))
                        .col(order_cents(Orders::RefOrFundraiserFeeCents))
                        .col(order_cents(Orders::ProcessingFeeCents))
                        .col(order_cents(Orders::TotalCents))
                        .col(ColumnDef::new(Orders::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Orders::PaymentStatus).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Orders::FulfillmentStatus)
                                .string_len(24)
                                .not_null()
                                .default("pending"),
                        )
                        .col(
                            ColumnDef::new(Orders::PaymentIntentId)
                                .string()
                                .null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::BillingEmail).string().null())
                        .col(ColumnDef::new(Orders::BillingName).string().null())
                        .col(ColumnDef::new(Orders::ShippingAddress).json().null())
                        .col(
                            ColumnDef::new(Orders::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_fulfillment_status")
                        .table(Orders::Table)
                        .col(Orders::FulfillmentStatus)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderItems::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::VariantId).uuid().null())
                        .col(ColumnDef::new(OrderItems::SellerId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::AffiliateId).uuid().null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(item_cents(OrderItems::UnitPriceCents))
                        .col(item_cents(OrderItems::SellerAmountCents))
                        .col(item_cents(OrderItems::AffiliateCommissionCents))
                        .col(item_cents(OrderItems::ReferralBonusCents))
                        .col(item_cents(OrderItems::PlatformFeeCents))
                        .col(item_cents(OrderItems::PlatformNetCents))
                        .col(item_cents(OrderItems::ProcessorFeeCents))
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CheckoutIntents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden, Clone, Copy)]
    pub(super) enum CheckoutIntents {
        Table,
        Id,
        SellerId,
        BuyerId,
        AffiliateId,
        ReferrerId,
        FundraiserId,
        StoreId,
        Currency,
        LineItems,
        ItemsSubtotalCents,
        AffiliateFeeCents,
        PlatformFeeCents,
        RefOrFundraiserFeeCents,
        ShippingCents,
        TaxCents,
        ProcessingFeeCents,
        SellerTransferCents,
        TotalCents,
        AffiliateRateBps,
        SplitVersion,
        SplitJson,
        Status,
        ProviderSessionId,
        ProviderPaymentIntentId,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden, Clone, Copy)]
    pub(super) enum Orders {
        Table,
        Id,
        CheckoutIntentId,
        SellerId,
        BuyerId,
        AffiliateId,
        ReferrerId,
        FundraiserId,
        Currency,
        ItemsSubtotalCents,
        ShippingCents,
        TaxCents,
        AffiliateFeeCents,
        PlatformFeeCents,
        RefOrFundraiserFeeCents,
        ProcessingFeeCents,
        TotalCents,
        Status,
        PaymentStatus,
        FulfillmentStatus,
        PaymentIntentId,
        BillingEmail,
        BillingName,
        ShippingAddress,
        CompletedAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden, Clone, Copy)]
    pub(super) enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        VariantId,
        SellerId,
        AffiliateId,
        Quantity,
        UnitPriceCents,
        SellerAmountCents,
        AffiliateCommissionCents,
        ReferralBonusCents,
        PlatformFeeCents,
        PlatformNetCents,
        ProcessorFeeCents,
        CreatedAt,
    }
}

mod m20240601_000003_create_ledger_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_ledger_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Commissions::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Commissions::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Commissions::AffiliateId).uuid().not_null())
                        .col(ColumnDef::new(Commissions::OrderId).uuid().not_null())
                        .col(ColumnDef::new(Commissions::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Commissions::AmountCents).big_integer().not_null())
                        .col(ColumnDef::new(Commissions::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Commissions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .unique()
                        .name("uq_commissions_affiliate_order_product")
                        .table(Commissions::Table)
                        .col(Commissions::AffiliateId)
                        .col(Commissions::OrderId)
                        .col(Commissions::ProductId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(RecruiterEarnings::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(RecruiterEarnings::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(RecruiterEarnings::RecruiterId).uuid().not_null())
                        .col(ColumnDef::new(RecruiterEarnings::RecruitId).uuid().not_null())
                        .col(ColumnDef::new(RecruiterEarnings::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(RecruiterEarnings::AmountCents)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RecruiterEarnings::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PaymentDistributions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentDistributions::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(PaymentDistributions::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(PaymentDistributions::RecipientType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentDistributions::RecipientId).uuid().null())
                        .col(
                            ColumnDef::new(PaymentDistributions::AmountCents)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentDistributions::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentDistributions::AvailableAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentDistributions::ReleasedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentDistributions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_distributions_status_available")
                        .table(PaymentDistributions::Table)
                        .col(PaymentDistributions::Status)
                        .col(PaymentDistributions::AvailableAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(UserEarnings::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(UserEarnings::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(UserEarnings::UserId).uuid().not_null())
                        .col(ColumnDef::new(UserEarnings::Role).string_len(16).not_null())
                        .col(
                            ColumnDef::new(UserEarnings::HeldBalanceCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(UserEarnings::CurrentBalanceCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(UserEarnings::PendingPayoutCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(UserEarnings::TotalEarnedCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(UserEarnings::PaidOutCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(UserEarnings::LastPayoutAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(UserEarnings::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UserEarnings::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .unique()
                        .name("uq_user_earnings_user_role")
                        .table(UserEarnings::Table)
                        .col(UserEarnings::UserId)
                        .col(UserEarnings::Role)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PayoutBatches::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(PayoutBatches::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(PayoutBatches::BatchNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PayoutBatches::Status).string_len(24).not_null())
                        .col(
                            ColumnDef::new(PayoutBatches::TotalAmountCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PayoutBatches::PayoutCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PayoutBatches::FailedCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PayoutBatches::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PayoutBatches::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Payouts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payouts::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Payouts::BatchId).uuid().not_null())
                        .col(ColumnDef::new(Payouts::UserId).uuid().not_null())
                        .col(ColumnDef::new(Payouts::Role).string_len(16).not_null())
                        .col(ColumnDef::new(Payouts::AmountCents).big_integer().not_null())
                        .col(ColumnDef::new(Payouts::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Payouts::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Payouts::TransferId).string().null())
                        .col(ColumnDef::new(Payouts::FailureReason).text().null())
                        .col(
                            ColumnDef::new(Payouts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payouts_batch")
                                .from(Payouts::Table, Payouts::BatchId)
                                .to(PayoutBatches::Table, PayoutBatches::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payouts::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PayoutBatches::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(UserEarnings::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PaymentDistributions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(RecruiterEarnings::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Commissions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Commissions {
        Table,
        Id,
        AffiliateId,
        OrderId,
        ProductId,
        AmountCents,
        Status,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum RecruiterEarnings {
        Table,
        Id,
        RecruiterId,
        RecruitId,
        OrderId,
        AmountCents,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum PaymentDistributions {
        Table,
        Id,
        OrderId,
        RecipientType,
        RecipientId,
        AmountCents,
        Status,
        AvailableAt,
        ReleasedAt,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum UserEarnings {
        Table,
        Id,
        UserId,
        Role,
        HeldBalanceCents,
        CurrentBalanceCents,
        PendingPayoutCents,
        TotalEarnedCents,
        PaidOutCents,
        LastPayoutAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum PayoutBatches {
        Table,
        Id,
        BatchNumber,
        Status,
        TotalAmountCents,
        PayoutCount,
        FailedCount,
        CreatedAt,
        CompletedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum Payouts {
        Table,
        Id,
        BatchId,
        UserId,
        Role,
        AmountCents,
        Currency,
        Status,
        TransferId,
        FailureReason,
        CreatedAt,
    }
}

mod m20240601_000004_create_supplier_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_supplier_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SupplierOrders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(SupplierOrders::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(SupplierOrders::OrderId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(SupplierOrders::SupplierOrderNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(SupplierOrders::SupplierOrderId).string().null())
                        .col(ColumnDef::new(SupplierOrders::Status).string_len(24).not_null())
                        .col(
                            ColumnDef::new(SupplierOrders::EstimatedCostCents)
                                .big_integer()
                                .null(),
                        )
                        .col(ColumnDef::new(SupplierOrders::ErrorMessage).text().null())
                        .col(ColumnDef::new(SupplierOrders::SupplierStatus).string_len(32).null())
                        .col(ColumnDef::new(SupplierOrders::TrackingNumber).string().null())
                        .col(ColumnDef::new(SupplierOrders::TrackingUrl).text().null())
                        .col(ColumnDef::new(SupplierOrders::Payload).json().null())
                        .col(
                            ColumnDef::new(SupplierOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SupplierOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_supplier_orders_status")
                        .table(SupplierOrders::Table)
                        .col(SupplierOrders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SupplierTokens::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SupplierTokens::Id)
                                .integer()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(SupplierTokens::AccessToken).text().not_null())
                        .col(
                            ColumnDef::new(SupplierTokens::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SupplierTokens::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SupplierTokens::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SupplierOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum SupplierOrders {
        Table,
        Id,
        OrderId,
        SupplierOrderNumber,
        SupplierOrderId,
        Status,
        EstimatedCostCents,
        ErrorMessage,
        SupplierStatus,
        TrackingNumber,
        TrackingUrl,
        Payload,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum SupplierTokens {
        Table,
        Id,
        AccessToken,
        ExpiresAt,
        UpdatedAt,
    }
}
