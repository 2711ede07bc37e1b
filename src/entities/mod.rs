//! Persistence entities for the cart and order engine
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod stock;
pub mod user;

// Re-export entities
pub use order::{Entity as Order, Model as OrderModel, OrderStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use payment::{Entity as Payment, Model as PaymentModel};
pub use product::{Entity as Product, Model as ProductModel};
pub use stock::{Entity as Stock, Model as StockModel};
pub use user::{Entity as User, Model as UserModel, UserRole};
